use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use gridfeed_core::DataSource;
use gridfeed_storage::{Clock, LedgerError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::{IngestPipeline, RunTally};
use crate::registry::{RegistryError, SourceRegistry};

#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub from: NaiveDate,
    /// Inclusive; defaults to the publisher's current date.
    pub to: Option<NaiveDate>,
    /// Empty means every enabled source.
    pub source_ids: Vec<String>,
    /// Re-run pairs the ledger already shows as complete.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub pairs: usize,
    pub skipped_complete: usize,
    pub tally: RunTally,
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfill range starts after it ends ({from} > {to})")]
    InvertedRange { from: NaiveDate, to: NaiveDate },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("job ledger: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct Backfill {
    registry: Arc<SourceRegistry>,
    pipeline: Arc<IngestPipeline>,
    clock: Arc<dyn Clock>,
    publisher_tz: Tz,
    concurrency: usize,
}

impl Backfill {
    pub fn new(
        registry: Arc<SourceRegistry>,
        pipeline: Arc<IngestPipeline>,
        clock: Arc<dyn Clock>,
        publisher_tz: Tz,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            pipeline,
            clock,
            publisher_tz,
            concurrency: concurrency.max(1),
        }
    }

    /// Ingest every (source, date) pair in the range, oldest date first.
    ///
    /// Completed pairs are skipped unless forced. The publisher's current
    /// date is always re-run since its reports keep growing during the day.
    pub async fn run(&self, request: &BackfillRequest) -> Result<BackfillSummary, BackfillError> {
        let today = self
            .clock
            .now()
            .with_timezone(&self.publisher_tz)
            .date_naive();
        let to = request.to.unwrap_or(today);
        if request.from > to {
            return Err(BackfillError::InvertedRange {
                from: request.from,
                to,
            });
        }
        let sources = self.registry.select(&request.source_ids)?;
        self.pipeline.reconcile_stale().await?;

        let mut summary = BackfillSummary::default();
        let mut units: Vec<(Arc<DataSource>, NaiveDate)> = Vec::new();
        for date in request.from.iter_days().take_while(|date| *date <= to) {
            for source in &sources {
                summary.pairs += 1;
                if !request.force
                    && date != today
                    && self
                        .pipeline
                        .ledger()
                        .is_complete(&source.source_id, date)
                        .await?
                {
                    debug!(source_id = %source.source_id, %date, "already complete; skipping");
                    summary.skipped_complete += 1;
                    continue;
                }
                units.push((Arc::clone(source), date));
            }
        }

        info!(
            from = %request.from,
            %to,
            sources = sources.len(),
            pairs = summary.pairs,
            to_run = units.len(),
            force = request.force,
            "backfill starting"
        );
        for unit in self.pipeline.run_bounded(units, self.concurrency).await {
            summary.tally.record(&unit);
        }
        info!(
            succeeded = summary.tally.succeeded,
            partial = summary.tally.partial,
            failed = summary.tally.failed,
            not_yet_available = summary.tally.not_yet_available,
            skipped_complete = summary.skipped_complete,
            inserted = summary.tally.rows_inserted,
            "backfill finished"
        );
        Ok(summary)
    }
}
