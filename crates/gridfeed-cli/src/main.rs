use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gridfeed_core::ScrapeJob;
use gridfeed_storage::{connect, migrate};
use gridfeed_sync::{BackfillRequest, IngestServices, SourceRegistry, SyncConfig};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gridfeed")]
#[command(about = "Ingest NYISO market reports into Postgres")]
struct Cli {
    /// Default level for gridfeed crates when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Override GRIDFEED_CONCURRENCY.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Override GRIDFEED_SOURCES.
    #[arg(long, global = true)]
    sources_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Schedule,
    /// Run a single scheduler tick and exit.
    Tick,
    /// Ingest a historical date range.
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        /// Inclusive; defaults to today in the publisher's time zone.
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Limit to these sources; repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Re-run dates that already completed.
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Show recent runs from the job ledger.
    Jobs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List the configured report sources.
    Sources,
    /// Delete measurements and finished jobs older than the given age.
    Prune {
        #[arg(long)]
        days: u32,
    },
}

fn init_tracing(level: &str, json: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("gridfeed={level}").into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn print_job(job: &ScrapeJob) {
    println!(
        "{}  {:<16} {}  {:<8} ins={:<6} dup={:<6} skip={:<4} {}{}",
        job.started_at.format("%Y-%m-%d %H:%M:%S"),
        job.source_id,
        job.target_date,
        job.status.as_str(),
        job.rows_inserted,
        job.rows_duplicate,
        job.rows_skipped,
        job.error_kind.map(|kind| kind.as_str()).unwrap_or(""),
        if job.fallback_used { " (archive)" } else { "" },
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);
    let mut config = SyncConfig::from_env()?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(path) = cli.sources_file {
        config.sources_path = Some(path);
    }

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Schedule => {
            let cron = config.tick_cron.clone();
            let retention_days = config.retention_days;
            let services = IngestServices::connect(config).await?;
            services
                .scheduler()
                .run_until_shutdown(&cron, retention_days)
                .await?;
        }
        Commands::Tick => {
            let services = IngestServices::connect(config).await?;
            services.pipeline.reconcile_stale().await?;
            let summary = services.scheduler().tick().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backfill {
            from,
            to,
            sources,
            force,
        } => {
            let services = IngestServices::connect(config).await?;
            let request = BackfillRequest {
                from,
                to,
                source_ids: sources,
                force,
            };
            let summary = services.backfill().run(&request).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let pool = connect(&config.database_url, 2).await?;
            migrate(&pool).await?;
            info!("migrations applied");
        }
        Commands::Jobs { source, limit } => {
            let services = IngestServices::connect(config).await?;
            let jobs = services
                .pipeline
                .ledger()
                .recent(source.as_deref(), limit)
                .await
                .context("reading job ledger")?;
            debug!(count = jobs.len(), source = source.as_deref(), "listing recent runs");
            for job in &jobs {
                print_job(job);
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load_or_builtin(config.sources_path.as_deref()).await?;
            for source in registry.all() {
                println!(
                    "{:<16} {:<7} {:<12} {:<15} {}{}",
                    source.source_id,
                    source.report_code,
                    source.frequency.as_str(),
                    source.parser.as_str(),
                    source.display_name,
                    if source.enabled { "" } else { " [disabled]" },
                );
            }
        }
        Commands::Prune { days } => {
            let services = IngestServices::connect(config).await?;
            let summary = services.scheduler().prune(days).await?;
            println!(
                "pruned {} measurements and {} jobs",
                summary.measurements, summary.jobs
            );
        }
    }

    Ok(())
}
