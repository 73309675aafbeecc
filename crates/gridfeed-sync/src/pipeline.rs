//! One ingestion run for one (source, date) pair, and a bounded pool of them.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use gridfeed_adapters::{parser_for, ParseError};
use gridfeed_core::{DataSource, JobErrorKind, JobOutcome, JobStatus, ScrapeJob};
use gridfeed_storage::{
    Clock, FetchError, FetchedReport, Fetcher, JobLedger, LedgerError, MeasurementStore,
    UpsertError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::lock::LockTable;

#[derive(Debug, Clone)]
pub enum RunReport {
    /// The run reached a terminal ledger state.
    Finished(ScrapeJob),
    /// Another run owns the pair; nothing was done.
    Contended,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("job ledger: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
enum RunFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("no usable rows: {summary}")]
    NoValidRows { skipped: u64, summary: String },
    #[error(transparent)]
    Store(#[from] UpsertError),
}

impl RunFailure {
    fn kind(&self) -> JobErrorKind {
        match self {
            Self::Fetch(FetchError::NotYetAvailable { .. }) => JobErrorKind::NotYetAvailable,
            Self::Fetch(FetchError::Transient { .. } | FetchError::BadArchive { .. }) => {
                JobErrorKind::Transient
            }
            Self::Fetch(FetchError::Rejected { .. }) => JobErrorKind::Rejected,
            Self::Parse(_) | Self::NoValidRows { .. } => JobErrorKind::Parse,
            Self::Store(_) => JobErrorKind::Storage,
        }
    }
}

pub struct IngestPipeline {
    fetcher: Fetcher,
    store: Arc<dyn MeasurementStore>,
    ledger: Arc<dyn JobLedger>,
    locks: Arc<LockTable>,
    clock: Arc<dyn Clock>,
    run_budget: Duration,
    stale_job_after: chrono::Duration,
}

impl IngestPipeline {
    pub fn new(
        fetcher: Fetcher,
        store: Arc<dyn MeasurementStore>,
        ledger: Arc<dyn JobLedger>,
        locks: Arc<LockTable>,
        clock: Arc<dyn Clock>,
        run_budget: Duration,
        stale_job_after: chrono::Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            ledger,
            locks,
            clock,
            run_budget,
            stale_job_after,
        }
    }

    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Fail runs left `running` by a process that died mid-run.
    pub async fn reconcile_stale(&self) -> Result<u64, LedgerError> {
        let reconciled = self
            .ledger
            .reconcile_stale(self.clock.now(), self.stale_job_after)
            .await?;
        if reconciled > 0 {
            warn!(reconciled, "marked abandoned runs as failed");
        }
        Ok(reconciled)
    }

    /// Fetch, parse and store one report, recording the attempt in the ledger.
    ///
    /// Skips silently when the pair is already being ingested, either in this
    /// process or according to the ledger.
    pub async fn run(&self, source: &DataSource, date: NaiveDate) -> Result<RunReport, RunError> {
        let Some(_guard) = self.locks.try_acquire(&source.source_id, date) else {
            debug!(source_id = %source.source_id, %date, "pair is locked; skipping");
            return Ok(RunReport::Contended);
        };

        let job = match self
            .ledger
            .begin(&source.source_id, date, self.clock.now(), self.stale_job_after)
            .await
        {
            Ok(job) => job,
            Err(LedgerError::AlreadyRunning { .. }) => {
                debug!(source_id = %source.source_id, %date, "ledger shows a live run; skipping");
                return Ok(RunReport::Contended);
            }
            Err(err) => return Err(err.into()),
        };

        let span = info_span!(
            "ingest_run",
            source_id = %source.source_id,
            target_date = %date,
            job_id = %job.job_id
        );
        let outcome = match tokio::time::timeout(self.run_budget, self.execute(source, date))
            .instrument(span.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::failed(
                self.clock.now(),
                JobErrorKind::Timeout,
                format!("run exceeded its {:?} budget", self.run_budget),
            ),
        };

        let job_id = job.job_id;
        let job = match self.ledger.finalize(job_id, outcome).await {
            Ok(job) => job,
            Err(err) => {
                // The job stays `running` and blocks the pair until it is stale.
                span.in_scope(|| {
                    error!(%job_id, %err, "could not finalize run; pair stays blocked until the job goes stale")
                });
                return Err(err.into());
            }
        };
        span.in_scope(|| log_finished(&job));
        Ok(RunReport::Finished(job))
    }

    async fn execute(&self, source: &DataSource, date: NaiveDate) -> JobOutcome {
        let report = match self.fetcher.fetch(source, date).await {
            Ok(report) => report,
            Err(err) => return self.failed(RunFailure::Fetch(err)),
        };

        let mut outcome = match self.load(source, &report).await {
            Ok(outcome) => outcome,
            Err(failure) => self.failed(failure),
        };
        outcome.fallback_used = report.fallback_used;
        outcome.content_hash = Some(report.content_hash);
        outcome
    }

    async fn load(&self, source: &DataSource, report: &FetchedReport) -> Result<JobOutcome, RunFailure> {
        let parsed = parser_for(source.parser).parse(&source.source_id, &report.text())?;
        debug!(
            rows_total = parsed.rows_total,
            rows_skipped = parsed.rows_skipped,
            records = parsed.records.len(),
            "report parsed"
        );
        if parsed.records.is_empty() && parsed.rows_skipped > 0 {
            return Err(RunFailure::NoValidRows {
                skipped: parsed.rows_skipped as u64,
                summary: parsed.skip_summary().unwrap_or_default(),
            });
        }

        let upserted = self.store.upsert(&parsed.records).await?;
        Ok(JobOutcome {
            finished_at: self.clock.now(),
            status: if parsed.rows_skipped == 0 {
                JobStatus::Success
            } else {
                JobStatus::Partial
            },
            rows_inserted: upserted.inserted,
            rows_duplicate: upserted.duplicates,
            rows_skipped: parsed.rows_skipped as u64,
            fallback_used: false,
            content_hash: None,
            error_kind: None,
            error_detail: parsed.skip_summary(),
        })
    }

    fn failed(&self, failure: RunFailure) -> JobOutcome {
        let mut outcome = JobOutcome::failed(self.clock.now(), failure.kind(), failure.to_string());
        if let RunFailure::NoValidRows { skipped, .. } = failure {
            outcome.rows_skipped = skipped;
        }
        outcome
    }

    /// Run every unit with at most `concurrency` in flight.
    pub async fn run_bounded(
        self: &Arc<Self>,
        units: Vec<(Arc<DataSource>, NaiveDate)>,
        concurrency: usize,
    ) -> Vec<UnitResult> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers = JoinSet::new();

        for (source, date) in units {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let pipeline = Arc::clone(self);
            workers.spawn(async move {
                let _permit = permit;
                let result = pipeline.run(&source, date).await;
                UnitResult {
                    source,
                    date,
                    result,
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(%err, "ingest worker did not complete"),
            }
        }
        results
    }
}

fn log_finished(job: &ScrapeJob) {
    match (job.status, job.error_kind) {
        (JobStatus::Success, _) => info!(
            inserted = job.rows_inserted,
            duplicates = job.rows_duplicate,
            fallback = job.fallback_used,
            "run succeeded"
        ),
        (JobStatus::Partial, _) => warn!(
            inserted = job.rows_inserted,
            duplicates = job.rows_duplicate,
            skipped = job.rows_skipped,
            detail = job.error_detail.as_deref().unwrap_or_default(),
            "run partially succeeded"
        ),
        (_, Some(JobErrorKind::NotYetAvailable)) => info!("report not yet published"),
        (_, kind) => warn!(
            kind = kind.map(|k| k.as_str()).unwrap_or("unknown"),
            detail = job.error_detail.as_deref().unwrap_or_default(),
            "run failed"
        ),
    }
}

#[derive(Debug)]
pub struct UnitResult {
    pub source: Arc<DataSource>,
    pub date: NaiveDate,
    pub result: Result<RunReport, RunError>,
}

/// Counts of run results, shared by tick and backfill summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub not_yet_available: usize,
    pub contended: usize,
    pub errored: usize,
    pub rows_inserted: u64,
    pub rows_duplicate: u64,
    pub rows_skipped: u64,
}

impl RunTally {
    pub fn record(&mut self, unit: &UnitResult) {
        match &unit.result {
            Ok(RunReport::Finished(job)) => {
                self.rows_inserted += job.rows_inserted;
                self.rows_duplicate += job.rows_duplicate;
                self.rows_skipped += job.rows_skipped;
                match job.status {
                    JobStatus::Success => self.succeeded += 1,
                    JobStatus::Partial => self.partial += 1,
                    JobStatus::Failed if job.error_kind == Some(JobErrorKind::NotYetAvailable) => {
                        self.not_yet_available += 1
                    }
                    JobStatus::Failed | JobStatus::Running => self.failed += 1,
                }
            }
            Ok(RunReport::Contended) => self.contended += 1,
            Err(err) => {
                error!(source_id = %unit.source.source_id, date = %unit.date, %err, "run could not be recorded");
                self.errored += 1;
            }
        }
    }
}
