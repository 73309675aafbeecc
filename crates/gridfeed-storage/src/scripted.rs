use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::http::{RawResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond { status: StatusCode, body: Vec<u8> },
    Timeout,
    ConnectionRefused,
    /// Never completes; used to exercise run budgets.
    Hang,
}

impl ScriptedReply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::Respond {
            status: StatusCode::OK,
            body: body.into(),
        }
    }

    pub fn status(code: u16) -> Self {
        Self::Respond {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: Vec::new(),
        }
    }
}

/// In-process transport replaying canned replies per URL.
///
/// Replies for a URL are consumed in order and the last one repeats. URLs
/// without a script answer 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: impl Into<String>, replies: Vec<ScriptedReply>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.into(), replies.into());
    }

    /// Every request seen so far with its per-attempt timeout.
    pub fn requests(&self) -> Vec<(String, Duration)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|(requested, _)| requested == url)
            .count()
    }

    fn next_reply(&self, url: &str) -> Option<ScriptedReply> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let queue = scripts.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((url.to_string(), timeout));

        match self.next_reply(url) {
            None => Ok(RawResponse {
                status: StatusCode::NOT_FOUND,
                body: Vec::new(),
            }),
            Some(ScriptedReply::Respond { status, body }) => Ok(RawResponse { status, body }),
            Some(ScriptedReply::Timeout) => Err(TransportError::Timeout(format!("{url} timed out"))),
            Some(ScriptedReply::ConnectionRefused) => {
                Err(TransportError::Connect(format!("{url} refused connection")))
            }
            Some(ScriptedReply::Hang) => std::future::pending().await,
        }
    }
}
