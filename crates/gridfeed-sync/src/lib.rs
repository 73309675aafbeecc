//! Scheduling, backfill and run orchestration for gridfeed.

mod backfill;
mod config;
mod lock;
mod pipeline;
mod registry;
mod scheduler;

#[cfg(test)]
mod scenarios;

use std::sync::Arc;

use anyhow::{Context, Result};
use gridfeed_storage::{
    connect, Clock, Fetcher, JobLedger, MeasurementStore, PgJobLedger, PgMeasurementStore,
    ReqwestTransport, SystemClock, Transport,
};
use tracing::info;

pub use backfill::{Backfill, BackfillError, BackfillRequest, BackfillSummary};
pub use config::{SyncConfig, DEFAULT_PUBLISHER_TZ};
pub use lock::{LockGuard, LockTable};
pub use pipeline::{IngestPipeline, RunError, RunReport, RunTally, UnitResult};
pub use registry::{RegistryError, SourceRegistry};
pub use scheduler::{PruneSummary, Scheduler, TickSummary};

pub const CRATE_NAME: &str = "gridfeed-sync";

/// Everything a scheduler or backfill needs, wired once at startup.
pub struct IngestServices {
    pub config: SyncConfig,
    pub registry: Arc<SourceRegistry>,
    pub pipeline: Arc<IngestPipeline>,
    pub clock: Arc<dyn Clock>,
}

impl IngestServices {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MeasurementStore>,
        ledger: Arc<dyn JobLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fetcher = Fetcher::new(
            transport,
            Arc::clone(&clock),
            config.backoff_policy(),
            config.http_timeout,
        );
        let locks = LockTable::new(config.lock_ttl_chrono(), Arc::clone(&clock));
        let pipeline = Arc::new(IngestPipeline::new(
            fetcher,
            store,
            ledger,
            locks,
            Arc::clone(&clock),
            config.run_budget,
            config.stale_job_threshold(),
        ));

        Self {
            config,
            registry: Arc::new(registry),
            pipeline,
            clock,
        }
    }

    /// Production wiring: Postgres storage, reqwest transport, system clock.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_builtin(config.sources_path.as_deref())
            .await
            .context("loading source catalog")?;
        let max_connections = u32::try_from(config.concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(2);
        let pool = connect(&config.database_url, max_connections).await?;
        let transport = ReqwestTransport::new(&config.http_client_config())?;
        info!(
            sources = registry.all().len(),
            enabled = registry.enabled().count(),
            "ingest services ready"
        );

        Ok(Self::new(
            config,
            registry,
            Arc::new(transport),
            Arc::new(PgMeasurementStore::new(pool.clone())),
            Arc::new(PgJobLedger::new(pool)),
            Arc::new(SystemClock),
        ))
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            &self.registry,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.clock),
            self.config.publisher_tz,
            self.config.concurrency,
        ))
    }

    pub fn backfill(&self) -> Backfill {
        Backfill::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.clock),
            self.config.publisher_tz,
            self.config.concurrency,
        )
    }
}
