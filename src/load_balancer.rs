//! Backend selection for a logical service.

use crate::circuit_breaker_registry::BreakerRegistry;
use crate::error::GatewayError;
use crate::health::HealthTable;
use crate::registry::{BackendKey, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Rotate through backends with no health filtering.
    RoundRobin,
    /// Lowest-latency backend among those healthy whose breaker would admit.
    #[default]
    HealthBased,
}

/// The chosen backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub address: String,
    /// Registration index within the service.
    pub index: usize,
    /// No backend passed the health filter; this is the first registered one.
    pub degraded: bool,
}

#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthTable>,
    breakers: Arc<BreakerRegistry>,
    cursors: HashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthTable>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let cursors = registry.services().map(|s| (s.to_string(), AtomicUsize::new(0))).collect();
        Self { registry, health, breakers, cursors }
    }

    /// Pick a backend for `service`. Fails only when the service has no backends.
    pub fn select_backend(
        &self,
        service: &str,
        policy: LoadBalancePolicy,
    ) -> Result<Selection, GatewayError> {
        let backends = self.registry.backends(service);
        if backends.is_empty() {
            return Err(GatewayError::NoHealthyBackend { service: service.to_string() });
        }
        match policy {
            LoadBalancePolicy::RoundRobin => Ok(self.round_robin(service, backends)),
            LoadBalancePolicy::HealthBased => Ok(self.health_based(service, backends)),
        }
    }

    fn round_robin(&self, service: &str, backends: &[String]) -> Selection {
        let turn = self.cursors.get(service).map_or(0, |c| c.fetch_add(1, Ordering::Relaxed));
        let index = turn % backends.len();
        Selection { address: backends[index].clone(), index, degraded: false }
    }

    fn health_based(&self, service: &str, backends: &[String]) -> Selection {
        let best = backends
            .iter()
            .enumerate()
            .filter_map(|(index, address)| {
                let key = BackendKey::new(service, address.as_str());
                let health = self.health.get(&key)?;
                let usable = health.healthy && self.breakers.would_admit(&key);
                usable.then_some((health.latency, index))
            })
            .min();

        match best {
            Some((_, index)) => {
                Selection { address: backends[index].clone(), index, degraded: false }
            }
            None => {
                warn!(
                    target: "tollgate::load_balancer",
                    service,
                    backend = %backends[0],
                    "no healthy backend; falling back to first registered"
                );
                Selection { address: backends[0].clone(), index: 0, degraded: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::{Clock, ManualClock};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        lb: LoadBalancer,
        health: Arc<HealthTable>,
        breakers: Arc<BreakerRegistry>,
    }

    fn fixture() -> Fixture {
        fixture_with_clock(&ManualClock::new(1_000_000))
    }

    fn fixture_with_clock(clock: &ManualClock) -> Fixture {
        let mut services = BTreeMap::new();
        services.insert("api".to_string(), vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        services.insert("empty".to_string(), vec![]);
        let registry = Arc::new(ServiceRegistry::new(&services));
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let health = Arc::new(HealthTable::with_clock(&registry, clock.clone()));
        let breakers = Arc::new(BreakerRegistry::with_clock(CircuitBreakerConfig::default(), clock));
        let lb = LoadBalancer::new(registry, health.clone(), breakers.clone());
        Fixture { lb, health, breakers }
    }

    fn key(addr: &str) -> BackendKey {
        BackendKey::new("api", addr)
    }

    async fn open(breakers: &BreakerRegistry, addr: &str) {
        for _ in 0..5 {
            breakers.record_result("api", addr, false, Duration::ZERO).await;
        }
    }

    #[tokio::test]
    async fn picks_lowest_latency_then_falls_back() {
        let f = fixture();
        f.health.record_success(&key("A"), Duration::from_millis(50));
        f.health.record_success(&key("B"), Duration::from_millis(10));
        f.health.record_failure(&key("C"));

        for _ in 0..10 {
            let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
            assert_eq!(chosen.address, "B");
            assert!(!chosen.degraded);
        }

        open(&f.breakers, "B").await;
        let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
        assert_eq!(chosen.address, "A");

        open(&f.breakers, "A").await;
        let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
        assert_eq!(chosen.address, "A");
        assert_eq!(chosen.index, 0);
        assert!(chosen.degraded);
    }

    #[tokio::test]
    async fn half_open_backend_with_trial_taken_is_skipped() {
        let clock = ManualClock::new(1_000_000);
        let f = fixture_with_clock(&clock);
        f.health.record_success(&key("A"), Duration::from_millis(5));
        f.health.record_success(&key("B"), Duration::from_millis(50));
        f.health.record_failure(&key("C"));
        open(&f.breakers, "A").await;
        clock.advance(Duration::from_secs(60));

        // Cooled down with the slot free: A is eligible for its trial.
        let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
        assert_eq!(chosen.address, "A");

        assert!(f.breakers.allow_request("api", "A"));
        for _ in 0..3 {
            let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
            assert_eq!(chosen.address, "B");
            assert!(!chosen.degraded);
        }
    }

    #[test]
    fn equal_latency_goes_to_registration_order() {
        let f = fixture();
        for addr in ["C", "B", "A"] {
            f.health.record_success(&key(addr), Duration::from_millis(20));
        }
        let chosen = f.lb.select_backend("api", LoadBalancePolicy::HealthBased).unwrap();
        assert_eq!(chosen.address, "A");
    }

    #[test]
    fn round_robin_cycles_without_health_filter() {
        let f = fixture();
        f.health.record_failure(&key("B"));
        let picks: Vec<String> = (0..4)
            .map(|_| f.lb.select_backend("api", LoadBalancePolicy::RoundRobin).unwrap().address)
            .collect();
        assert_eq!(picks, ["A", "B", "C", "A"]);
    }

    #[test]
    fn unknown_or_empty_service_has_no_backend() {
        let f = fixture();
        for service in ["missing", "empty"] {
            let err = f.lb.select_backend(service, LoadBalancePolicy::HealthBased).unwrap_err();
            assert!(err.is_no_healthy_backend());
            let err = f.lb.select_backend(service, LoadBalancePolicy::RoundRobin).unwrap_err();
            assert!(err.is_no_healthy_backend());
        }
    }
}
