//! Report retrieval with retry, backoff and monthly archive fallback.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use gridfeed_core::DataSource;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::extract_entry;
use crate::clock::Clock;
use crate::http::{classify_status, is_not_published, BackoffPolicy, RetryDisposition, Transport};

#[derive(Debug, Clone)]
pub struct FetchedReport {
    pub url: String,
    pub body: Vec<u8>,
    pub fallback_used: bool,
    pub content_hash: String,
}

impl FetchedReport {
    fn new(url: String, body: Vec<u8>, fallback_used: bool) -> Self {
        let content_hash = sha256_hex(&body);
        Self {
            url,
            body,
            fallback_used,
            content_hash,
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("report not yet published at {url}")]
    NotYetAvailable { url: String },
    #[error("giving up on {url} after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("http status {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("archive {url} is unreadable: {reason}")]
    BadArchive { url: String, reason: String },
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            backoff,
            timeout,
        }
    }

    /// Fetch the report published for `date`.
    ///
    /// A missing daily file falls back to the matching entry of that month's
    /// archive. Transient failures never trigger the fallback.
    pub async fn fetch(
        &self,
        source: &DataSource,
        date: NaiveDate,
    ) -> Result<FetchedReport, FetchError> {
        let span = info_span!("fetch_report", source_id = %source.source_id, %date);
        async move {
            let url = source.primary_url(date);
            let missing = match self.get_with_retry(&url, self.timeout).await {
                Ok(body) => return Ok(FetchedReport::new(url, body, false)),
                Err(err @ FetchError::NotYetAvailable { .. }) => err,
                Err(err) => return Err(err),
            };

            let Some(archive_url) = source.archive_url(date) else {
                return Err(missing);
            };
            let entry_name = source.archive_entry_name(date);
            debug!(%archive_url, %entry_name, "primary report missing; trying monthly archive");

            let archive = match self
                .get_with_retry(&archive_url, self.timeout.saturating_mul(2))
                .await
            {
                Ok(archive) => archive,
                Err(FetchError::NotYetAvailable { .. }) => return Err(missing),
                Err(err) => return Err(err),
            };

            match extract_entry(&archive, &entry_name) {
                Ok(Some(body)) => {
                    info!(%archive_url, %entry_name, "report recovered from monthly archive");
                    Ok(FetchedReport::new(archive_url, body, true))
                }
                Ok(None) => {
                    debug!(%archive_url, %entry_name, "archive does not contain the report");
                    Err(missing)
                }
                Err(err) => Err(FetchError::BadArchive {
                    url: archive_url,
                    reason: err.to_string(),
                }),
            }
        }
        .instrument(span)
        .await
    }

    async fn get_with_retry(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 0..attempts {
            match self.transport.get(url, timeout).await {
                Ok(resp) if resp.status.is_success() => return Ok(resp.body),
                Ok(resp) if is_not_published(resp.status) => {
                    return Err(FetchError::NotYetAvailable {
                        url: url.to_string(),
                    });
                }
                Ok(resp) => {
                    if classify_status(resp.status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Rejected {
                            status: resp.status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    last_reason = format!("http status {}", resp.status.as_u16());
                }
                Err(err) => {
                    last_reason = err.to_string();
                    if err.disposition() == RetryDisposition::NonRetryable {
                        return Err(FetchError::Transient {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            reason: last_reason,
                        });
                    }
                }
            }

            if attempt + 1 < attempts {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(url, attempt = attempt + 1, ?delay, reason = %last_reason, "retrying fetch");
                self.clock.sleep(delay).await;
            }
        }

        Err(FetchError::Transient {
            url: url.to_string(),
            attempts,
            reason: last_reason,
        })
    }
}
