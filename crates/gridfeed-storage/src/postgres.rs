//! PostgreSQL implementations of the measurement store and job ledger.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use gridfeed_core::{DimensionKind, JobErrorKind, JobOutcome, JobStatus, Measurement, ScrapeJob};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::ledger::{JobLedger, LedgerError, ABANDONED_DETAIL};
use crate::measurements::{MeasurementQuery, MeasurementStore, UpsertError, UpsertOutcome};

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(StdDuration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running database migrations")?;
    info!("database migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgMeasurementStore {
    pool: PgPool,
}

impl PgMeasurementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn reference_insert(kind: DimensionKind) -> Option<&'static str> {
    match kind {
        DimensionKind::Zone => {
            Some("INSERT INTO zones (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
        }
        DimensionKind::Interface => {
            Some("INSERT INTO interfaces (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
        }
        DimensionKind::Fuel | DimensionKind::Constraint => None,
    }
}

fn measurement_from_row(row: &PgRow) -> Result<Measurement, UpsertError> {
    let kind: String = row.try_get("dimension_kind")?;
    let dimension_kind = DimensionKind::parse(&kind)
        .ok_or_else(|| UpsertError::Decode(format!("dimension kind {kind}")))?;
    let Json(values): Json<BTreeMap<String, f64>> = row.try_get("readings")?;
    let Json(labels): Json<BTreeMap<String, String>> = row.try_get("labels")?;
    Ok(Measurement {
        source_id: row.try_get("source_id")?,
        dimension_kind,
        dimension_name: row.try_get("dimension_name")?,
        series: row.try_get("series")?,
        timestamp: row.try_get("ts")?,
        values,
        labels,
    })
}

#[async_trait]
impl MeasurementStore for PgMeasurementStore {
    async fn upsert(&self, records: &[Measurement]) -> Result<UpsertOutcome, UpsertError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = UpsertOutcome::default();

        for record in records {
            if let Some(sql) = reference_insert(record.dimension_kind) {
                sqlx::query(sql)
                    .bind(&record.dimension_name)
                    .execute(&mut *tx)
                    .await?;
            }

            let result = sqlx::query(
                "INSERT INTO measurements \
                 (source_id, dimension_kind, dimension_key, dimension_name, series, ts, readings, labels) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (source_id, dimension_key, ts) DO NOTHING",
            )
            .bind(&record.source_id)
            .bind(record.dimension_kind.as_str())
            .bind(record.dimension_key())
            .bind(&record.dimension_name)
            .bind(&record.series)
            .bind(record.timestamp)
            .bind(Json(&record.values))
            .bind(Json(&record.labels))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn query(&self, query: &MeasurementQuery) -> Result<Vec<Measurement>, UpsertError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT source_id, dimension_kind, dimension_name, series, ts, readings, labels \
             FROM measurements WHERE TRUE",
        );
        if let Some(source_id) = &query.source_id {
            builder.push(" AND source_id = ").push_bind(source_id);
        }
        if let Some(dimension_key) = &query.dimension_key {
            builder.push(" AND dimension_key = ").push_bind(dimension_key);
        }
        if let Some(from) = query.from {
            builder.push(" AND ts >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            builder.push(" AND ts < ").push_bind(to);
        }
        builder.push(" ORDER BY ts, dimension_key");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(measurement_from_row).collect()
    }

    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64, UpsertError> {
        let result = sqlx::query("DELETE FROM measurements WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "job_id, source_id, target_date, started_at, finished_at, status, \
     rows_inserted, rows_duplicate, rows_skipped, fallback_used, content_hash, error_kind, error_detail";

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, LedgerError> {
    let status: String = row.try_get("status")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let rows_inserted: i64 = row.try_get("rows_inserted")?;
    let rows_duplicate: i64 = row.try_get("rows_duplicate")?;
    let rows_skipped: i64 = row.try_get("rows_skipped")?;
    Ok(ScrapeJob {
        job_id: row.try_get("job_id")?,
        source_id: row.try_get("source_id")?,
        target_date: row.try_get("target_date")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| LedgerError::Decode(format!("status {status}")))?,
        rows_inserted: rows_inserted.max(0) as u64,
        rows_duplicate: rows_duplicate.max(0) as u64,
        rows_skipped: rows_skipped.max(0) as u64,
        fallback_used: row.try_get("fallback_used")?,
        content_hash: row.try_get("content_hash")?,
        error_kind: match error_kind {
            Some(kind) => Some(
                JobErrorKind::parse(&kind)
                    .ok_or_else(|| LedgerError::Decode(format!("error kind {kind}")))?,
            ),
            None => None,
        },
        error_detail: row.try_get("error_detail")?,
    })
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn begin(
        &self,
        source_id: &str,
        target_date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ScrapeJob, LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE scrape_jobs SET status = 'failed', finished_at = $3, \
             error_kind = 'abandoned', error_detail = $4 \
             WHERE source_id = $1 AND target_date = $2 AND status = 'running' AND started_at < $5",
        )
        .bind(source_id)
        .bind(target_date)
        .bind(now)
        .bind(ABANDONED_DETAIL)
        .bind(now - stale_after)
        .execute(&mut *tx)
        .await?;

        let job = ScrapeJob::started(source_id, target_date, now);
        let inserted = sqlx::query(
            "INSERT INTO scrape_jobs (job_id, source_id, target_date, started_at, status) \
             VALUES ($1, $2, $3, $4, 'running') \
             ON CONFLICT (source_id, target_date) WHERE status = 'running' DO NOTHING",
        )
        .bind(job.job_id)
        .bind(source_id)
        .bind(target_date)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LedgerError::AlreadyRunning {
                source_id: source_id.to_string(),
                target_date,
            });
        }

        tx.commit().await?;
        Ok(job)
    }

    async fn finalize(&self, job_id: Uuid, outcome: JobOutcome) -> Result<ScrapeJob, LedgerError> {
        let sql = format!(
            "UPDATE scrape_jobs SET finished_at = $2, status = $3, rows_inserted = $4, \
             rows_duplicate = $5, rows_skipped = $6, fallback_used = $7, content_hash = $8, \
             error_kind = $9, error_detail = $10 \
             WHERE job_id = $1 AND status = 'running' RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(outcome.finished_at)
            .bind(outcome.status.as_str())
            .bind(outcome.rows_inserted as i64)
            .bind(outcome.rows_duplicate as i64)
            .bind(outcome.rows_skipped as i64)
            .bind(outcome.fallback_used)
            .bind(&outcome.content_hash)
            .bind(outcome.error_kind.map(|kind| kind.as_str()))
            .bind(&outcome.error_detail)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        let exists = sqlx::query("SELECT 1 FROM scrape_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Err(match exists {
            Some(_) => LedgerError::AlreadyFinalized(job_id),
            None => LedgerError::UnknownJob(job_id),
        })
    }

    async fn is_complete(&self, source_id: &str, target_date: NaiveDate) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT 1 FROM scrape_jobs \
             WHERE source_id = $1 AND target_date = $2 AND status IN ('success', 'partial') \
             AND rows_inserted + rows_duplicate + rows_skipped > 0 LIMIT 1",
        )
        .bind(source_id)
        .bind(target_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE scrape_jobs SET status = 'failed', finished_at = $1, \
             error_kind = 'abandoned', error_detail = $2 \
             WHERE status = 'running' AND started_at < $3",
        )
        .bind(now)
        .bind(ABANDONED_DETAIL)
        .bind(now - stale_after)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>, LedgerError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM scrape_jobs"));
        if let Some(source_id) = source_id {
            builder.push(" WHERE source_id = ").push_bind(source_id);
        }
        builder
            .push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result =
            sqlx::query("DELETE FROM scrape_jobs WHERE status <> 'running' AND started_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
