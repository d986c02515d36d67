//! Backend health table shared by the health checker, the dispatcher and the
//! load balancer.

use crate::clock::{Clock, SystemClock};
use crate::registry::{BackendKey, ServiceRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Last known health of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub healthy: bool,
    /// Latency of the last successful observation.
    pub latency: Option<Duration>,
    pub last_checked_millis: Option<u64>,
    pub consecutive_errors: u32,
}

impl Default for BackendHealth {
    /// Backends start healthy so traffic flows before the first probe round.
    fn default() -> Self {
        Self { healthy: true, latency: None, last_checked_millis: None, consecutive_errors: 0 }
    }
}

/// One entry per registered backend, each behind its own lock.
/// Concurrent writers are last-writer-wins.
#[derive(Debug)]
pub struct HealthTable {
    entries: HashMap<BackendKey, Mutex<BackendHealth>>,
    clock: Arc<dyn Clock>,
}

impl HealthTable {
    pub fn new(registry: &ServiceRegistry) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: &ServiceRegistry, clock: Arc<dyn Clock>) -> Self {
        let entries = registry.keys().map(|key| (key, Mutex::default())).collect();
        Self { entries, clock }
    }

    /// Record a successful call or probe. Returns `false` for unregistered backends.
    pub fn record_success(&self, backend: &BackendKey, latency: Duration) -> bool {
        let now = self.clock.now_millis();
        self.update(backend, |health| {
            health.healthy = true;
            health.consecutive_errors = 0;
            health.latency = Some(latency);
            health.last_checked_millis = Some(now);
        })
    }

    /// Record a failed or timed-out call or probe. The last good latency is kept.
    pub fn record_failure(&self, backend: &BackendKey) -> bool {
        let now = self.clock.now_millis();
        self.update(backend, |health| {
            health.healthy = false;
            health.consecutive_errors = health.consecutive_errors.saturating_add(1);
            health.last_checked_millis = Some(now);
        })
    }

    pub fn record(&self, backend: &BackendKey, success: bool, latency: Duration) -> bool {
        if success {
            self.record_success(backend, latency)
        } else {
            self.record_failure(backend)
        }
    }

    pub fn get(&self, backend: &BackendKey) -> Option<BackendHealth> {
        self.entries
            .get(backend)
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Every backend, sorted by key.
    pub fn snapshot(&self) -> Vec<(BackendKey, BackendHealth)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                (key.clone(), entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update(&self, backend: &BackendKey, apply: impl FnOnce(&mut BackendHealth)) -> bool {
        match self.entries.get(backend) {
            Some(entry) => {
                let mut guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
                apply(&mut *guard);
                true
            }
            None => {
                debug!(target: "tollgate::health", backend = %backend, "observation for unregistered backend ignored");
                false
            }
        }
    }
}
