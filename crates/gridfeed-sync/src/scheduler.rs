use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use gridfeed_core::{DataSource, JobStatus};
use gridfeed_storage::Clock;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::pipeline::{IngestPipeline, RunReport, RunTally};
use crate::registry::SourceRegistry;

const HOUSEKEEPING_CRON: &str = "0 30 3 * * *";

/// Minutes after the publisher's midnight during which the previous day is
/// still fetched, picking up intervals posted after its last tick.
const PREVIOUS_DAY_GRACE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    /// Sources re-fetched for the previous day.
    pub catch_up: usize,
    pub tally: RunTally,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub measurements: u64,
    pub jobs: u64,
}

/// Decides which sources are due and dispatches them to the pipeline.
///
/// Every enabled source starts due. A success or partial run moves the
/// source's next due time to its next publication boundary; anything else
/// leaves it due for the following tick.
///
/// Shortly after midnight the previous day is fetched once more per
/// publication boundary, so its final intervals are not left behind.
pub struct Scheduler {
    sources: Vec<Arc<DataSource>>,
    pipeline: Arc<IngestPipeline>,
    clock: Arc<dyn Clock>,
    publisher_tz: Tz,
    concurrency: usize,
    next_due: Mutex<HashMap<String, NaiveDateTime>>,
    catch_up_due: Mutex<HashMap<String, NaiveDateTime>>,
    draining: AtomicBool,
    in_flight: RwLock<()>,
}

impl Scheduler {
    pub fn new(
        registry: &SourceRegistry,
        pipeline: Arc<IngestPipeline>,
        clock: Arc<dyn Clock>,
        publisher_tz: Tz,
        concurrency: usize,
    ) -> Self {
        Self {
            sources: registry.enabled().cloned().collect(),
            pipeline,
            clock,
            publisher_tz,
            concurrency: concurrency.max(1),
            next_due: Mutex::new(HashMap::new()),
            catch_up_due: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            in_flight: RwLock::new(()),
        }
    }

    /// Wall-clock time in the publisher's zone; report dates follow it.
    pub fn publisher_now(&self) -> NaiveDateTime {
        self.clock
            .now()
            .with_timezone(&self.publisher_tz)
            .naive_local()
    }

    pub fn due_sources(&self, now: NaiveDateTime) -> Vec<Arc<DataSource>> {
        due_in(&self.next_due, &self.sources, now)
    }

    /// Sources whose previous day should be fetched again at `now`.
    pub fn catch_up_sources(&self, now: NaiveDateTime) -> Vec<Arc<DataSource>> {
        let since_midnight = now - now.date().and_time(NaiveTime::default());
        if since_midnight >= Duration::minutes(PREVIOUS_DAY_GRACE_MINUTES) {
            return Vec::new();
        }
        due_in(&self.catch_up_due, &self.sources, now)
    }

    pub fn next_due(&self, source_id: &str) -> Option<NaiveDateTime> {
        self.next_due
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .copied()
    }

    fn advance(
        table: &Mutex<HashMap<String, NaiveDateTime>>,
        source: &DataSource,
        now: NaiveDateTime,
    ) {
        let due_at = source.frequency.next_boundary(now);
        debug!(source_id = %source.source_id, %due_at, "source satisfied until next boundary");
        table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.source_id.clone(), due_at);
    }

    /// Run every due source once for today's publisher-local date, plus the
    /// previous day for sources still inside the post-midnight grace window.
    pub async fn tick(&self) -> TickSummary {
        if self.draining.load(Ordering::SeqCst) {
            debug!("scheduler is draining; tick skipped");
            return TickSummary::default();
        }
        let _in_flight = self.in_flight.read().await;

        let now = self.publisher_now();
        let today = now.date();
        let due = self.due_sources(now);
        let catch_up = self.catch_up_sources(now);
        let mut summary = TickSummary {
            due: due.len(),
            catch_up: catch_up.len(),
            ..TickSummary::default()
        };
        if due.is_empty() && catch_up.is_empty() {
            debug!(%now, "no sources due");
            return summary;
        }

        let mut units: Vec<(Arc<DataSource>, NaiveDate)> =
            due.iter().map(|source| (Arc::clone(source), today)).collect();
        if let Some(yesterday) = today.pred_opt() {
            units.extend(catch_up.iter().map(|source| (Arc::clone(source), yesterday)));
        }
        for unit in self.pipeline.run_bounded(units, self.concurrency).await {
            summary.tally.record(&unit);
            if let Ok(RunReport::Finished(job)) = &unit.result {
                if matches!(job.status, JobStatus::Success | JobStatus::Partial) {
                    let table = if unit.date == today {
                        &self.next_due
                    } else {
                        &self.catch_up_due
                    };
                    Self::advance(table, &unit.source, now);
                }
            }
        }

        info!(
            due = summary.due,
            catch_up = summary.catch_up,
            succeeded = summary.tally.succeeded,
            partial = summary.tally.partial,
            failed = summary.tally.failed,
            not_yet_available = summary.tally.not_yet_available,
            contended = summary.tally.contended,
            inserted = summary.tally.rows_inserted,
            "scheduler tick finished"
        );
        summary
    }

    /// Delete measurements and finished jobs older than `retention_days`.
    pub async fn prune(&self, retention_days: u32) -> Result<PruneSummary> {
        let window = Duration::days(i64::from(retention_days));
        let measurements = self
            .pipeline
            .store()
            .prune_before(self.publisher_now() - window)
            .await
            .context("pruning measurements")?;
        let jobs = self
            .pipeline
            .ledger()
            .prune_before(self.clock.now() - window)
            .await
            .context("pruning job ledger")?;
        info!(measurements, jobs, retention_days, "pruned old data");
        Ok(PruneSummary { measurements, jobs })
    }

    /// Tick on `cron` until ctrl-c, then let in-flight runs finish.
    pub async fn run_until_shutdown(self: Arc<Self>, cron: &str, retention_days: u32) -> Result<()> {
        self.pipeline
            .reconcile_stale()
            .await
            .context("reconciling abandoned runs")?;

        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let ticker = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let scheduler = Arc::clone(&ticker);
            Box::pin(async move {
                scheduler.tick().await;
            })
        })
        .with_context(|| format!("creating tick job for cron {cron}"))?;
        sched.add(job).await.context("adding tick job")?;

        if retention_days > 0 {
            let pruner = Arc::clone(&self);
            let job = Job::new_async(HOUSEKEEPING_CRON, move |_uuid, _l| {
                let scheduler = Arc::clone(&pruner);
                Box::pin(async move {
                    if let Err(err) = scheduler.prune(retention_days).await {
                        error!(error = %format!("{err:#}"), "housekeeping failed");
                    }
                })
            })
            .context("creating housekeeping job")?;
            sched.add(job).await.context("adding housekeeping job")?;
        }

        sched.start().await.context("starting scheduler")?;
        info!(cron, sources = self.sources.len(), "scheduler started");

        // Everything is due at startup; don't wait for the first cron slot.
        let first = Arc::clone(&self);
        tokio::spawn(async move {
            first.tick().await;
        });

        tokio::signal::ctrl_c()
            .await
            .context("listening for shutdown signal")?;
        info!("shutdown requested; waiting for in-flight runs");
        self.draining.store(true, Ordering::SeqCst);
        if let Err(err) = sched.shutdown().await {
            warn!(%err, "scheduler did not stop cleanly");
        }
        let _drained = self.in_flight.write().await;
        info!("scheduler stopped");
        Ok(())
    }
}

fn due_in(
    table: &Mutex<HashMap<String, NaiveDateTime>>,
    sources: &[Arc<DataSource>],
    now: NaiveDateTime,
) -> Vec<Arc<DataSource>> {
    let table = table.lock().unwrap_or_else(|e| e.into_inner());
    sources
        .iter()
        .filter(|source| {
            table
                .get(&source.source_id)
                .map_or(true, |due_at| *due_at <= now)
        })
        .cloned()
        .collect()
}
