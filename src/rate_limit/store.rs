use crate::clock::{duration_to_millis, Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Result of an atomic conditional add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub admitted: bool,
    /// Entries in the window after the call, including the new one if admitted.
    pub count: u64,
    /// Timestamp of the oldest entry still in the window.
    pub oldest_millis: Option<u64>,
}

/// Storage for sliding-window request logs.
///
/// A key holds a set of unique members, each stamped with a millisecond
/// timestamp. Errors never reach gateway callers: the rate limiter converts
/// them into fail-open admissions.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Remove entries stamped strictly before `threshold_millis`.
    async fn remove_older_than(&self, key: &str, threshold_millis: u64) -> Result<(), StoreError>;

    /// Entries currently stored under `key`.
    async fn count(&self, key: &str) -> Result<u64, StoreError>;

    /// Atomically: drop entries stamped before `at_millis - ttl`, then if fewer than
    /// `limit` remain add `member` at `at_millis` and refresh the key expiry to `ttl`.
    /// A full window is left untouched.
    async fn add_if_under_limit(
        &self,
        key: &str,
        member: &str,
        at_millis: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission, StoreError>;

    /// Short name for logs and snapshots.
    fn name(&self) -> &'static str {
        "custom"
    }
}

#[derive(Debug, Default)]
struct WindowLog {
    /// Ordered by timestamp.
    entries: VecDeque<(u64, String)>,
    expires_at_millis: u64,
}

impl WindowLog {
    fn prune(&mut self, threshold: u64) {
        while self.entries.front().is_some_and(|(at, _)| *at < threshold) {
            self.entries.pop_front();
        }
    }

    fn insert(&mut self, at: u64, member: &str) {
        if self.entries.iter().any(|(_, m)| m == member) {
            return;
        }
        let pos = self.entries.partition_point(|(ts, _)| *ts <= at);
        self.entries.insert(pos, (at, member.to_string()));
    }

    fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|(at, _)| *at)
    }

    /// The key outlives its ttl by one millisecond so that an entry exactly
    /// one window old is still counted.
    fn expired(&self, now: u64) -> bool {
        self.expires_at_millis < now
    }
}

/// Adds between two sweeps of expired keys.
pub const DEFAULT_PURGE_EVERY: u64 = 1024;

/// Process-local store: one mutex per key, lazy expiry.
///
/// Expired keys are swept every [`DEFAULT_PURGE_EVERY`] adds, so idle callers
/// do not accumulate. Quotas enforced with this store are per process, not global.
#[derive(Clone)]
pub struct InMemoryCounterStore {
    logs: Arc<DashMap<String, Arc<Mutex<WindowLog>>>>,
    clock: Arc<dyn Clock>,
    adds: Arc<AtomicU64>,
    purge_every: u64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock decides when idle keys expire.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: Arc::new(DashMap::new()),
            clock,
            adds: Arc::new(AtomicU64::new(0)),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }

    /// Sweep expired keys every `adds` calls to `add_if_under_limit`.
    pub fn with_purge_every(mut self, adds: u64) -> Self {
        self.purge_every = adds.max(1);
        self
    }

    fn log(&self, key: &str) -> Arc<Mutex<WindowLog>> {
        if let Some(log) = self.logs.get(key) {
            return log.clone();
        }
        self.logs.entry(key.to_string()).or_default().clone()
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }

    /// Drop every expired key nobody is using. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            // A clone outside the map means a call is about to use this log.
            if Arc::strong_count(log) > 1 {
                return true;
            }
            match log.try_lock() {
                Ok(log) => !log.expired(now),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.logs.len())
    }

    fn maybe_purge(&self) {
        let adds = self.adds.fetch_add(1, Ordering::Relaxed) + 1;
        if adds % self.purge_every == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(target: "tollgate::rate_limit", removed, "expired counters purged");
            }
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCounterStore").field("keys", &self.logs.len()).finish()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn remove_older_than(&self, key: &str, threshold_millis: u64) -> Result<(), StoreError> {
        if let Some(log) = self.logs.get(key).map(|l| l.clone()) {
            log.lock().unwrap_or_else(PoisonError::into_inner).prune(threshold_millis);
        }
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let Some(log) = self.logs.get(key).map(|l| l.clone()) else {
            return Ok(0);
        };
        let log = log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.expired(now) {
            return Ok(0);
        }
        Ok(log.entries.len() as u64)
    }

    async fn add_if_under_limit(
        &self,
        key: &str,
        member: &str,
        at_millis: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission, StoreError> {
        self.maybe_purge();
        let ttl_millis = duration_to_millis(ttl);
        let now = self.clock.now_millis();
        let log = self.log(key);
        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);

        if log.expired(now) {
            log.entries.clear();
        }
        log.prune(at_millis.saturating_sub(ttl_millis));

        let count = log.entries.len() as u64;
        if count >= limit {
            return Ok(WindowAdmission { admitted: false, count, oldest_millis: log.oldest() });
        }
        log.insert(at_millis, member);
        log.expires_at_millis = now.saturating_add(ttl_millis);
        Ok(WindowAdmission {
            admitted: true,
            count: log.entries.len() as u64,
            oldest_millis: log.oldest(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
