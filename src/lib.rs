#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Request-admission core for an API gateway: decide whether a request may
//! proceed, pick a backend for it, and keep failing backends out of rotation.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting** keyed by IP, user, API key or globally,
//!   with tier- and path-scoped rules over a pluggable [`CounterStore`]
//! - **Fail-open admission** when the counter store is down or slow
//! - **Per-backend circuit breakers** (Closed → Open → HalfOpen) with a single
//!   trial request after cooldown
//! - **Load balancing**: round-robin, or health-based by lowest probe latency
//!   with a degraded fallback
//! - **Background health checking** with bounded probes and clean shutdown
//! - **Telemetry** as Tower services, plus a point-in-time [`GatewaySnapshot`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::time::Duration;
//! use tollgate::config::{GatewayConfig, RateLimitRule, ScopeKind};
//! use tollgate::request::{ForwardRequest, ForwardResponse, InboundRequest};
//! use tollgate::Gateway;
//! use tower::service_fn;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GatewayConfig::default()
//!         .with_service("orders", ["http://orders-1:8080", "http://orders-2:8080"])
//!         .with_rule(RateLimitRule::new("per-ip", ScopeKind::PerIp, 100, Duration::from_secs(3600)));
//!
//!     let forwarder = service_fn(|_req: ForwardRequest| async {
//!         Ok::<_, Infallible>(ForwardResponse::new(200))
//!     });
//!     let gateway = Gateway::builder(config, forwarder).build().unwrap();
//!
//!     let request = InboundRequest::new("orders", "GET", "/orders/42")
//!         .with_client_ip("203.0.113.7".parse().unwrap());
//!     match gateway.handle(request).await {
//!         Ok(response) => println!("{} from {}", response.status, response.backend),
//!         Err(err) => println!("{}: {}", err.status_code(), err.rejection().to_json()),
//!     }
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod health_checker;
pub mod identity;
pub mod load_balancer;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod registry;
pub mod request;
pub mod snapshot;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use circuit_breaker_registry::BreakerRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessTier, ConfigError, GatewayConfig, RateLimitRule, ScopeKind};
pub use dispatcher::{Gateway, GatewayBuilder};
pub use error::{GatewayError, ProbeError, Rejection, StoreError};
pub use health::{BackendHealth, HealthTable};
pub use health_checker::{HealthChecker, HealthCheckerHandle, HealthProbe};
pub use identity::{HeaderIdentityResolver, Identity, IdentityResolver};
pub use load_balancer::{LoadBalancePolicy, LoadBalancer, Selection};
pub use rate_limit::{
    AdmissionLayer, CounterStore, Decision, InMemoryCounterStore, Quota, RateLimiter, RuleSet,
};
pub use registry::{BackendKey, ServiceRegistry};
pub use snapshot::GatewaySnapshot;
pub use telemetry::{GatewayEvent, Telemetry};
pub use timeout::TimeoutPolicy;
