//! Durable record of scrape attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use gridfeed_core::{JobErrorKind, JobOutcome, JobStatus, ScrapeJob};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("a run for {source_id} on {target_date} is already in progress")]
    AlreadyRunning {
        source_id: String,
        target_date: NaiveDate,
    },
    #[error("job {0} does not exist")]
    UnknownJob(Uuid),
    #[error("job {0} has already been finalized")]
    AlreadyFinalized(Uuid),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub(crate) const ABANDONED_DETAIL: &str = "run exceeded the staleness threshold without finishing";

#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Open a `running` entry. Running entries older than `stale_after` are
    /// marked abandoned first; a live one for the same pair is refused.
    async fn begin(
        &self,
        source_id: &str,
        target_date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ScrapeJob, LedgerError>;

    /// Move a running entry to its terminal state. Exactly once per job.
    async fn finalize(&self, job_id: Uuid, outcome: JobOutcome) -> Result<ScrapeJob, LedgerError>;

    async fn is_complete(&self, source_id: &str, target_date: NaiveDate) -> Result<bool, LedgerError>;

    /// Fail every running entry started before `now - stale_after`.
    async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, LedgerError>;

    /// Newest first.
    async fn recent(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>, LedgerError>;

    /// Drop finished entries that started before `cutoff`.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;
}

fn abandon(job: &mut ScrapeJob, now: DateTime<Utc>) {
    job.apply_outcome(JobOutcome::failed(
        now,
        JobErrorKind::Abandoned,
        ABANDONED_DETAIL,
    ));
}

#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    jobs: Mutex<Vec<ScrapeJob>>,
    finalize_unavailable: AtomicBool,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<ScrapeJob> {
        self.lock().clone()
    }

    /// Seed an entry as if another process had written it.
    pub fn insert(&self, job: ScrapeJob) {
        self.lock().push(job);
    }

    /// Make `finalize` fail as if the backing database were down.
    pub fn set_finalize_unavailable(&self, unavailable: bool) {
        self.finalize_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScrapeJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn begin(
        &self,
        source_id: &str,
        target_date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ScrapeJob, LedgerError> {
        let mut jobs = self.lock();
        for job in jobs.iter_mut().filter(|job| {
            job.status == JobStatus::Running
                && job.source_id == source_id
                && job.target_date == target_date
        }) {
            if job.started_at < now - stale_after {
                abandon(job, now);
            } else {
                return Err(LedgerError::AlreadyRunning {
                    source_id: source_id.to_string(),
                    target_date,
                });
            }
        }

        let job = ScrapeJob::started(source_id, target_date, now);
        jobs.push(job.clone());
        Ok(job)
    }

    async fn finalize(&self, job_id: Uuid, outcome: JobOutcome) -> Result<ScrapeJob, LedgerError> {
        if self.finalize_unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("finalize rejected".to_string()));
        }
        let mut jobs = self.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.job_id == job_id)
            .ok_or(LedgerError::UnknownJob(job_id))?;
        if job.status.is_terminal() {
            return Err(LedgerError::AlreadyFinalized(job_id));
        }
        job.apply_outcome(outcome);
        Ok(job.clone())
    }

    async fn is_complete(&self, source_id: &str, target_date: NaiveDate) -> Result<bool, LedgerError> {
        Ok(self.lock().iter().any(|job| {
            job.source_id == source_id && job.target_date == target_date && job.is_complete()
        }))
    }

    async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, LedgerError> {
        let mut reconciled = 0;
        for job in self.lock().iter_mut() {
            if job.status == JobStatus::Running && job.started_at < now - stale_after {
                abandon(job, now);
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn recent(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>, LedgerError> {
        let mut jobs: Vec<ScrapeJob> = self
            .lock()
            .iter()
            .filter(|job| source_id.map_or(true, |id| job.source_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|job| !job.status.is_terminal() || job.started_at >= cutoff);
        Ok((before - jobs.len()) as u64)
    }
}
