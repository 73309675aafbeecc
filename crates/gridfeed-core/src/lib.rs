//! Core domain model for gridfeed: report sources, measurements and scrape jobs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridfeed-core";

/// Placeholder replaced by the target date (`20251110`).
pub const DATE_PLACEHOLDER: &str = "{YYYYMMDD}";
/// Placeholder replaced by the first day of the target month (`20251101`).
pub const MONTH_PLACEHOLDER: &str = "{YYYYMM01}";

/// How often the publisher refreshes a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrequencyClass {
    FiveMinute,
    Hourly,
    SixHourly,
    Daily,
}

impl FrequencyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinute => "five-minute",
            Self::Hourly => "hourly",
            Self::SixHourly => "six-hourly",
            Self::Daily => "daily",
        }
    }

    /// First publication boundary strictly after `now`, in publisher-local time.
    pub fn next_boundary(&self, now: NaiveDateTime) -> NaiveDateTime {
        let midnight = now.date().and_time(NaiveTime::default());
        let minute_of_day = i64::from(now.hour() * 60 + now.minute());
        let step = match self {
            Self::FiveMinute => 5,
            Self::Hourly => 60,
            Self::SixHourly => 6 * 60,
            Self::Daily => 24 * 60,
        };
        let floored = minute_of_day - minute_of_day % step;
        midnight + Duration::minutes(floored + step)
    }
}

impl fmt::Display for FrequencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsing strategy applied to a report body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    ZonalPrice,
    ZonalLoad,
    LoadForecast,
    InterfaceFlow,
    AncillaryPrice,
    FuelMix,
    Constraint,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZonalPrice => "zonal_price",
            Self::ZonalLoad => "zonal_load",
            Self::LoadForecast => "load_forecast",
            Self::InterfaceFlow => "interface_flow",
            Self::AncillaryPrice => "ancillary_price",
            Self::FuelMix => "fuel_mix",
            Self::Constraint => "constraint",
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Static description of one published report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub source_id: String,
    pub report_code: String,
    pub display_name: String,
    pub url_template: String,
    #[serde(default)]
    pub archive_template: Option<String>,
    /// Name of the daily file inside the monthly archive; defaults to the
    /// last path segment of the primary URL.
    #[serde(default)]
    pub filename_pattern: Option<String>,
    pub frequency: FrequencyClass,
    pub parser: ParserKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl DataSource {
    pub fn primary_url(&self, date: NaiveDate) -> String {
        render_date_template(&self.url_template, date)
    }

    pub fn archive_url(&self, date: NaiveDate) -> Option<String> {
        self.archive_template
            .as_deref()
            .map(|template| render_date_template(template, date))
    }

    pub fn archive_entry_name(&self, date: NaiveDate) -> String {
        match &self.filename_pattern {
            Some(pattern) => render_date_template(pattern, date),
            None => {
                let url = self.primary_url(date);
                url.rsplit('/').next().unwrap_or(&url).to_string()
            }
        }
    }
}

pub fn render_date_template(template: &str, date: NaiveDate) -> String {
    template
        .replace(DATE_PLACEHOLDER, &date.format("%Y%m%d").to_string())
        .replace(MONTH_PLACEHOLDER, &date.format("%Y%m01").to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Zone,
    Interface,
    Fuel,
    Constraint,
}

impl DimensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Interface => "interface",
            Self::Fuel => "fuel",
            Self::Constraint => "constraint",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "zone" => Some(Self::Zone),
            "interface" => Some(Self::Interface),
            "fuel" => Some(Self::Fuel),
            "constraint" => Some(Self::Constraint),
            _ => None,
        }
    }
}

/// Identity of a measurement: at most one row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source_id: String,
    pub dimension_key: String,
    pub timestamp: NaiveDateTime,
}

/// One typed observation parsed from a report.
///
/// `timestamp` is the interval time as published (publisher-local, naive).
/// `series` splits one dimension into several records for wide reports,
/// e.g. the reserve product of an ancillary price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source_id: String,
    pub dimension_kind: DimensionKind,
    pub dimension_name: String,
    pub series: Option<String>,
    pub timestamp: NaiveDateTime,
    pub values: BTreeMap<String, f64>,
    pub labels: BTreeMap<String, String>,
}

impl Measurement {
    pub fn new(
        source_id: impl Into<String>,
        dimension_kind: DimensionKind,
        dimension_name: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            dimension_kind,
            dimension_name: dimension_name.into(),
            series: None,
            timestamp,
            values: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn dimension_key(&self) -> String {
        match &self.series {
            Some(series) => format!("{}/{}", self.dimension_name, series),
            None => self.dimension_name.clone(),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source_id: self.source_id.clone(),
            dimension_key: self.dimension_key(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    NotYetAvailable,
    Transient,
    Rejected,
    Parse,
    Storage,
    Timeout,
    Abandoned,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotYetAvailable => "not_yet_available",
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::Parse => "parse",
            Self::Storage => "storage",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_yet_available" => Some(Self::NotYetAvailable),
            "transient" => Some(Self::Transient),
            "rejected" => Some(Self::Rejected),
            "parse" => Some(Self::Parse),
            "storage" => Some(Self::Storage),
            "timeout" => Some(Self::Timeout),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger row for one attempt to ingest one source for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_id: Uuid,
    pub source_id: String,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub rows_inserted: u64,
    pub rows_duplicate: u64,
    pub rows_skipped: u64,
    pub fallback_used: bool,
    pub content_hash: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub error_detail: Option<String>,
}

impl ScrapeJob {
    pub fn started(
        source_id: impl Into<String>,
        target_date: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_id: source_id.into(),
            target_date,
            started_at,
            finished_at: None,
            status: JobStatus::Running,
            rows_inserted: 0,
            rows_duplicate: 0,
            rows_skipped: 0,
            fallback_used: false,
            content_hash: None,
            error_kind: None,
            error_detail: None,
        }
    }

    /// A pair counts as done once a run succeeded (fully or partially) and
    /// actually saw rows; an empty report is retried by backfill.
    pub fn is_complete(&self) -> bool {
        matches!(self.status, JobStatus::Success | JobStatus::Partial)
            && self.rows_inserted + self.rows_duplicate + self.rows_skipped > 0
    }

    pub fn apply_outcome(&mut self, outcome: JobOutcome) {
        self.finished_at = Some(outcome.finished_at);
        self.status = outcome.status;
        self.rows_inserted = outcome.rows_inserted;
        self.rows_duplicate = outcome.rows_duplicate;
        self.rows_skipped = outcome.rows_skipped;
        self.fallback_used = outcome.fallback_used;
        self.content_hash = outcome.content_hash;
        self.error_kind = outcome.error_kind;
        self.error_detail = outcome.error_detail;
    }
}

/// Terminal state written into a ledger entry by `finalize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    pub rows_inserted: u64,
    pub rows_duplicate: u64,
    pub rows_skipped: u64,
    pub fallback_used: bool,
    pub content_hash: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub error_detail: Option<String>,
}

impl JobOutcome {
    pub fn failed(
        finished_at: DateTime<Utc>,
        kind: JobErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            finished_at,
            status: JobStatus::Failed,
            rows_inserted: 0,
            rows_duplicate: 0,
            rows_skipped: 0,
            fallback_used: false,
            content_hash: None,
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
        }
    }
}
