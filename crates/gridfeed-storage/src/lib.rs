//! Report fetching, measurement persistence and the scrape-job ledger for gridfeed.

mod archive;
mod clock;
mod fetcher;
mod http;
mod ledger;
mod measurements;
mod postgres;
#[cfg(any(test, feature = "test-util"))]
mod scripted;

pub use archive::extract_entry;
#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use fetcher::{sha256_hex, FetchError, FetchedReport, Fetcher};
pub use http::{
    classify_status, is_not_published, BackoffPolicy, HttpClientConfig, RawResponse,
    ReqwestTransport, RetryDisposition, Transport, TransportError,
};
pub use ledger::{InMemoryJobLedger, JobLedger, LedgerError};
pub use measurements::{
    InMemoryMeasurementStore, MeasurementQuery, MeasurementStore, UpsertError, UpsertOutcome,
};
pub use postgres::{connect, migrate, PgJobLedger, PgMeasurementStore};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedReply, ScriptedTransport};

pub const CRATE_NAME: &str = "gridfeed-storage";
