//! Convenient re-exports for common Tollgate types.
pub use crate::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::BreakerRegistry,
    clock::{Clock, ManualClock, SystemClock},
    config::{AccessTier, GatewayConfig, HealthCheckConfig, RateLimitRule, ScopeKind},
    dispatcher::Gateway,
    error::{GatewayError, ProbeError, StoreError},
    health_checker::{HealthChecker, HealthProbe},
    identity::{Identity, IdentityResolver},
    load_balancer::LoadBalancePolicy,
    rate_limit::{AdmissionLayer, CounterStore, Decision, RateLimiter, RuleSet},
    registry::BackendKey,
    request::{ForwardRequest, ForwardResponse, GatewayResponse, InboundRequest},
    telemetry::{GatewayEvent, MemorySink, Telemetry, TelemetrySink},
};
