//! Idempotent measurement persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use gridfeed_core::{DimensionKind, Measurement, NaturalKey};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for UpsertError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementQuery {
    pub source_id: Option<String>,
    pub dimension_key: Option<String>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub limit: Option<usize>,
}

impl MeasurementQuery {
    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, key: &NaturalKey) -> bool {
        self.source_id.as_deref().map_or(true, |s| s == key.source_id)
            && self
                .dimension_key
                .as_deref()
                .map_or(true, |d| d == key.dimension_key)
            && self.from.map_or(true, |from| key.timestamp >= from)
            && self.to.map_or(true, |to| key.timestamp < to)
    }
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Insert every record whose natural key is new; existing keys are left
    /// untouched and counted as duplicates. The batch commits atomically.
    async fn upsert(&self, records: &[Measurement]) -> Result<UpsertOutcome, UpsertError>;

    /// Rows ordered by timestamp then dimension key. `to` is exclusive.
    async fn query(&self, query: &MeasurementQuery) -> Result<Vec<Measurement>, UpsertError>;

    /// Delete rows with timestamps before `cutoff`, returning how many went.
    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64, UpsertError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<NaturalKey, Measurement>,
    references: BTreeSet<(DimensionKind, String)>,
    fail_after: Option<usize>,
    unavailable: bool,
}

/// Process-local store; a batch is staged then applied under one lock.
#[derive(Debug, Default)]
pub struct InMemoryMeasurementStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upsert abort after staging `records` rows.
    pub fn fail_after(&self, records: usize) {
        self.lock().fail_after = Some(records);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn references(&self) -> Vec<(DimensionKind, String)> {
        self.lock().references.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MeasurementStore for InMemoryMeasurementStore {
    async fn upsert(&self, records: &[Measurement]) -> Result<UpsertOutcome, UpsertError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(UpsertError::StorageUnavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        let fail_after = state.fail_after.take();

        let mut staged: HashMap<NaturalKey, &Measurement> = HashMap::new();
        let mut outcome = UpsertOutcome::default();
        for (index, record) in records.iter().enumerate() {
            if fail_after == Some(index) {
                return Err(UpsertError::StorageUnavailable(format!(
                    "write aborted after {index} records"
                )));
            }
            let key = record.natural_key();
            if state.rows.contains_key(&key) || staged.contains_key(&key) {
                outcome.duplicates += 1;
            } else {
                staged.insert(key, record);
                outcome.inserted += 1;
            }
        }

        for (key, record) in staged {
            state
                .references
                .insert((record.dimension_kind, record.dimension_name.clone()));
            state.rows.insert(key, record.clone());
        }
        Ok(outcome)
    }

    async fn query(&self, query: &MeasurementQuery) -> Result<Vec<Measurement>, UpsertError> {
        let state = self.lock();
        let mut rows: Vec<Measurement> = state
            .rows
            .iter()
            .filter(|(key, _)| query.matches(key))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.dimension_key().cmp(&b.dimension_key()))
        });
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64, UpsertError> {
        let mut state = self.lock();
        let before = state.rows.len();
        state.rows.retain(|key, _| key.timestamp >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }
}
