use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use gridfeed_storage::Clock;
use tracing::warn;

type LockKey = (String, NaiveDate);

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: u64,
    acquired_at: DateTime<Utc>,
}

/// Per-(source, date) mutual exclusion inside one process.
///
/// Entries expire after `ttl` so a holder that never returns cannot wedge a
/// pair forever; an expired entry may be taken over.
pub struct LockTable {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
    held: Mutex<HashMap<LockKey, LockEntry>>,
}

impl LockTable {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            clock,
            next_token: AtomicU64::new(1),
            held: Mutex::new(HashMap::new()),
        })
    }

    /// `None` when a live holder already owns the pair.
    pub fn try_acquire(self: &Arc<Self>, source_id: &str, date: NaiveDate) -> Option<LockGuard> {
        let now = self.clock.now();
        let key = (source_id.to_string(), date);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = held.get(&key) {
            if now - entry.acquired_at < self.ttl {
                return None;
            }
            warn!(source_id, %date, acquired_at = %entry.acquired_at, "taking over expired lock");
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            key.clone(),
            LockEntry {
                token,
                acquired_at: now,
            },
        );
        Some(LockGuard {
            table: Arc::clone(self),
            key,
            token,
        })
    }

    pub fn is_held(&self, source_id: &str, date: NaiveDate) -> bool {
        let now = self.clock.now();
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(source_id.to_string(), date))
            .is_some_and(|entry| now - entry.acquired_at < self.ttl)
    }

    fn release(&self, key: &LockKey, token: u64) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(key).is_some_and(|entry| entry.token == token) {
            held.remove(key);
        }
    }
}

/// Releases its pair on drop, unless the lock was taken over after expiry.
pub struct LockGuard {
    table: Arc<LockTable>,
    key: LockKey,
    token: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}
