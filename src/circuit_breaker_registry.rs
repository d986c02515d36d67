//! Per-backend circuit breakers, created lazily on first observation.
//!
//! Breakers are keyed by `(service, backend)` and are never removed while the
//! process runs. Operators can inspect and reset them through the registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::circuit_breaker::{
    Acquired, CircuitBreaker, CircuitBreakerConfig, CircuitState, Rejected, Transition,
};
use crate::clock::{Clock, SystemClock};
use crate::registry::BackendKey;
use crate::telemetry::{CircuitBreakerEvent, GatewayEvent, Telemetry};
use serde::Serialize;
use tracing::{debug, info};

/// Errors from the breaker registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRegistryError {
    /// No breaker has been created for this backend yet.
    #[error("circuit breaker for '{backend}' not found")]
    NotFound { backend: BackendKey },
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub backend: BackendKey,
    pub state: CircuitState,
    pub failure_count: usize,
}

/// All breakers of a gateway, sharing one configuration and clock.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<BackendKey, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::default(), config, clock, telemetry: Telemetry::noop() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `backend`, created Closed on first use.
    pub fn breaker(&self, backend: &BackendKey) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(backend) {
            return existing;
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(backend.clone())
            .or_insert_with(|| {
                debug!(target: "tollgate::circuit_breaker", backend = %backend, "circuit breaker created");
                Arc::new(CircuitBreaker::new(self.config.clone(), self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, backend: &BackendKey) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.get(backend).cloned()
    }

    /// Effective state; backends never observed are Closed.
    pub fn state(&self, backend: &BackendKey) -> CircuitState {
        self.get(backend).map_or(CircuitState::Closed, |b| b.state())
    }

    /// Non-claiming admission check; backends never observed admit.
    pub fn would_admit(&self, backend: &BackendKey) -> bool {
        self.get(backend).map_or(true, |b| b.would_admit())
    }

    /// Whether a request to `service`/`backend` may go out now. Claims the
    /// half-open trial slot when it returns `true` for a recovering backend.
    pub fn allow_request(&self, service: &str, backend: &str) -> bool {
        self.breaker(&BackendKey::new(service, backend)).allow_request()
    }

    /// Like [`allow_request`](Self::allow_request), with details and telemetry.
    pub async fn try_acquire(&self, backend: &BackendKey) -> Result<Acquired, Rejected> {
        let result = self.breaker(backend).try_acquire();
        if let Ok(Acquired { transition: Some(transition), .. }) = &result {
            self.emit_transition(backend, *transition).await;
        }
        result
    }

    /// Feed one outcome for `service`/`backend` into its breaker.
    pub async fn record_result(
        &self,
        service: &str,
        backend: &str,
        success: bool,
        latency: Duration,
    ) -> Option<Transition> {
        let key = BackendKey::new(service, backend);
        let transition = self.breaker(&key).record(success);
        debug!(target: "tollgate::circuit_breaker", backend = %key, success, ?latency, "outcome recorded");
        if let Some(transition) = transition {
            self.emit_transition(&key, transition).await;
        }
        transition
    }

    /// Force a breaker back to Closed.
    pub fn reset(&self, backend: &BackendKey) -> Result<(), BreakerRegistryError> {
        match self.get(backend) {
            Some(breaker) => {
                breaker.reset();
                info!(target: "tollgate::circuit_breaker", backend = %backend, "circuit breaker reset by operator");
                Ok(())
            }
            None => Err(BreakerRegistryError::NotFound { backend: backend.clone() }),
        }
    }

    pub fn reset_all(&self) {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        for breaker in map.values() {
            breaker.reset();
        }
        info!(target: "tollgate::circuit_breaker", count = map.len(), "all circuit breakers reset by operator");
    }

    /// Every known breaker, sorted by backend.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<BreakerSnapshot> = map
            .iter()
            .map(|(backend, breaker)| BreakerSnapshot {
                backend: backend.clone(),
                state: breaker.state(),
                failure_count: breaker.failure_count(),
            })
            .collect();
        entries.sort_by(|a, b| a.backend.cmp(&b.backend));
        entries
    }

    async fn emit_transition(&self, backend: &BackendKey, transition: Transition) {
        self.telemetry.emit(transition_event(backend, transition)).await;
    }
}

pub(crate) fn transition_event(backend: &BackendKey, transition: Transition) -> GatewayEvent {
    let backend = backend.clone();
    let event = match transition.to {
        CircuitState::Open => {
            CircuitBreakerEvent::Opened { backend, failure_count: transition.failures }
        }
        CircuitState::HalfOpen => CircuitBreakerEvent::HalfOpen { backend },
        CircuitState::Closed => CircuitBreakerEvent::Closed { backend },
    };
    GatewayEvent::CircuitBreaker(event)
}
