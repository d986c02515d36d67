//! Operational snapshot: rule counts, per-backend state and request totals.

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::clock::duration_to_millis;
use crate::health::HealthTable;
use crate::rate_limit::RateLimiter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request counters maintained by the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct GatewayMetrics {
    pub(crate) requests: AtomicU64,
    pub(crate) denied: AtomicU64,
    pub(crate) no_backend: AtomicU64,
    pub(crate) breaker_rejections: AtomicU64,
    pub(crate) degraded_selections: AtomicU64,
    pub(crate) forwarded: AtomicU64,
    pub(crate) backend_errors: AtomicU64,
    pub(crate) upstream_timeouts: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

impl GatewayMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn totals(&self, store_failures: u64) -> RequestTotals {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RequestTotals {
            requests: load(&self.requests),
            denied: load(&self.denied),
            store_failures,
            no_backend: load(&self.no_backend),
            breaker_rejections: load(&self.breaker_rejections),
            degraded_selections: load(&self.degraded_selections),
            forwarded: load(&self.forwarded),
            backend_errors: load(&self.backend_errors),
            upstream_timeouts: load(&self.upstream_timeouts),
            cancelled: load(&self.cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub active: usize,
    pub total: usize,
    /// Rules dropped at load time because they were invalid.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestTotals {
    pub requests: u64,
    pub denied: u64,
    /// Fail-open admissions.
    pub store_failures: u64,
    pub no_backend: u64,
    pub breaker_rejections: u64,
    pub degraded_selections: u64,
    pub forwarded: u64,
    /// Forwarded calls that failed, timed out or answered 5xx.
    pub backend_errors: u64,
    pub upstream_timeouts: u64,
    /// Calls abandoned by the caller before the backend answered.
    pub cancelled: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSnapshot {
    pub service: String,
    pub address: String,
    pub breaker_state: CircuitState,
    pub failure_count: usize,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub consecutive_errors: u32,
    pub last_checked_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub backends: usize,
    pub healthy: usize,
    pub health_ratio: f64,
}

/// Everything an operator dashboard needs, serialisable with serde.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySnapshot {
    pub rules: RuleCounts,
    pub counter_store: &'static str,
    pub totals: RequestTotals,
    /// Denied over requests seen.
    pub block_rate: f64,
    /// Healthy backends over registered backends.
    pub health_ratio: f64,
    pub services: Vec<ServiceSnapshot>,
    pub backends: Vec<BackendSnapshot>,
}

impl GatewaySnapshot {
    pub(crate) fn collect(
        limiter: &RateLimiter,
        health: &HealthTable,
        breakers: &BreakerRegistry,
        metrics: &GatewayMetrics,
    ) -> Self {
        let rules = limiter.rules();
        let totals = metrics.totals(limiter.stats().store_failures);

        let backends: Vec<BackendSnapshot> = health
            .snapshot()
            .into_iter()
            .map(|(key, h)| {
                let breaker = breakers.get(&key);
                BackendSnapshot {
                    breaker_state: breaker.as_ref().map_or(CircuitState::Closed, |b| b.state()),
                    failure_count: breaker.as_ref().map_or(0, |b| b.failure_count()),
                    healthy: h.healthy,
                    latency_ms: h.latency.map(duration_to_millis),
                    consecutive_errors: h.consecutive_errors,
                    last_checked_millis: h.last_checked_millis,
                    service: key.service,
                    address: key.address,
                }
            })
            .collect();

        let mut per_service: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for backend in &backends {
            let entry = per_service.entry(backend.service.as_str()).or_default();
            entry.0 += 1;
            if backend.healthy {
                entry.1 += 1;
            }
        }
        let services = per_service
            .into_iter()
            .map(|(name, (total, healthy))| ServiceSnapshot {
                name: name.to_string(),
                backends: total,
                healthy,
                health_ratio: ratio(healthy as u64, total as u64),
            })
            .collect();
        let healthy = backends.iter().filter(|b| b.healthy).count();

        Self {
            rules: RuleCounts {
                active: rules.active_count(),
                total: rules.total_count(),
                skipped: rules.skipped_count(),
            },
            counter_store: limiter.store_name(),
            block_rate: ratio(totals.denied, totals.requests),
            health_ratio: ratio(healthy as u64, backends.len() as u64),
            totals,
            services,
            backends,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
