//! The gateway dispatcher: `Identify → RateLimit → Route → Forward → Report`.
//!
//! [`Gateway`] owns every component and drives one request through the
//! pipeline. Forwarding goes through any Tower service accepting a
//! [`ForwardRequest`]; the `tollgate-http` crate provides one over reqwest.
//!
//! `Report` always runs once a backend has been chosen and its breaker passed:
//! after a success, after a failure or timeout, and when the caller drops the
//! request future mid-flight (recorded as a failure).
//!
//! ```rust
//! use std::convert::Infallible;
//! use tollgate::config::GatewayConfig;
//! use tollgate::request::{ForwardRequest, ForwardResponse, InboundRequest};
//! use tollgate::Gateway;
//! use tower::service_fn;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = GatewayConfig::default().with_service("echo", ["http://echo-1"]);
//! let forwarder = service_fn(|req: ForwardRequest| async move {
//!     Ok::<_, Infallible>(ForwardResponse::new(200).with_body(req.path.into_bytes()))
//! });
//! let gateway = Gateway::builder(config, forwarder).build().unwrap();
//!
//! let response = gateway.handle(InboundRequest::new("echo", "GET", "/hello")).await.unwrap();
//! assert_eq!(response.body, b"/hello");
//! assert_eq!(response.backend, "http://echo-1");
//! # }
//! ```

use crate::circuit_breaker::Rejected;
use crate::circuit_breaker_registry::{transition_event, BreakerRegistry, BreakerRegistryError};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, GatewayConfig, HealthCheckConfig};
use crate::error::GatewayError;
use crate::health::HealthTable;
use crate::health_checker::{HealthChecker, HealthProbe};
use crate::identity::{HeaderIdentityResolver, IdentityResolver};
use crate::load_balancer::{LoadBalancePolicy, LoadBalancer};
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{Quota, RateLimiter, RuleSet};
use crate::registry::{BackendKey, ServiceRegistry};
use crate::request::{ForwardRequest, ForwardResponse, GatewayResponse, InboundRequest};
use crate::snapshot::{GatewayMetrics, GatewaySnapshot};
use crate::telemetry::{GatewayEvent, RequestOutcome, SelectionEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

/// Components shared by every clone of a [`Gateway`].
struct Shared {
    registry: Arc<ServiceRegistry>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthTable>,
    balancer: LoadBalancer,
    resolver: Arc<dyn IdentityResolver>,
    policy: LoadBalancePolicy,
    forward_timeout: TimeoutPolicy,
    health_config: HealthCheckConfig,
    telemetry: Telemetry,
    metrics: GatewayMetrics,
}

/// Request-admission gateway over a forwarder `F`.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway<F> {
    shared: Arc<Shared>,
    forwarder: F,
}

impl<F> Gateway<F> {
    pub fn builder(config: GatewayConfig, forwarder: F) -> GatewayBuilder<F> {
        GatewayBuilder {
            config,
            forwarder,
            store: None,
            resolver: Arc::new(HeaderIdentityResolver::new()),
            policy: LoadBalancePolicy::default(),
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::noop(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.shared.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.shared.breakers
    }

    pub fn health(&self) -> &Arc<HealthTable> {
        &self.shared.health
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.shared.registry
    }

    pub fn policy(&self) -> LoadBalancePolicy {
        self.shared.policy
    }

    /// Health checker wired to this gateway's registry, health table and breakers.
    pub fn health_checker(&self, probe: Arc<dyn HealthProbe>) -> Result<HealthChecker, ConfigError> {
        let checker = HealthChecker::new(
            self.shared.registry.clone(),
            self.shared.health.clone(),
            self.shared.breakers.clone(),
            probe,
            &self.shared.health_config,
        )?;
        Ok(checker.with_telemetry(self.shared.telemetry.clone()))
    }

    /// Force a backend's breaker back to Closed.
    pub fn reset_breaker(&self, backend: &BackendKey) -> Result<(), BreakerRegistryError> {
        self.shared.breakers.reset(backend)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot::collect(
            &self.shared.limiter,
            &self.shared.health,
            &self.shared.breakers,
            &self.shared.metrics,
        )
    }
}

impl<F> Gateway<F>
where
    F: Service<ForwardRequest, Response = ForwardResponse> + Clone + Send + 'static,
    F::Error: fmt::Display + Send,
    F::Future: Send,
{
    /// Drive one request through the pipeline.
    pub async fn handle(&self, request: InboundRequest) -> Result<GatewayResponse, GatewayError> {
        let shared = &self.shared;
        GatewayMetrics::incr(&shared.metrics.requests);

        // Identify
        let identity = shared.resolver.resolve(&request);

        // RateLimit
        let decision = shared.limiter.evaluate(&identity, &request.path).await;
        let quota = decision.quota().copied();
        if let Some(err) = decision.into_error() {
            GatewayMetrics::incr(&shared.metrics.denied);
            debug!(target: "tollgate::dispatcher", service = %request.service, path = %request.path, error = %err, "request denied");
            return Err(err);
        }

        // Route
        let selection = match shared.balancer.select_backend(&request.service, shared.policy) {
            Ok(selection) => selection,
            Err(err) => {
                GatewayMetrics::incr(&shared.metrics.no_backend);
                debug!(target: "tollgate::dispatcher", service = %request.service, "no backend registered");
                return Err(err);
            }
        };
        let backend = BackendKey::new(request.service.as_str(), selection.address.as_str());
        if selection.degraded {
            GatewayMetrics::incr(&shared.metrics.degraded_selections);
            shared
                .telemetry
                .emit(GatewayEvent::Selection(SelectionEvent::Degraded { backend: backend.clone() }))
                .await;
        }
        if let Err(Rejected { failure_count, open_for }) = shared.breakers.try_acquire(&backend).await {
            GatewayMetrics::incr(&shared.metrics.breaker_rejections);
            debug!(target: "tollgate::dispatcher", backend = %backend, failure_count, "breaker rejected request");
            return Err(GatewayError::BreakerOpen { backend, failure_count, open_for });
        }

        // Forward
        let mut report = ReportGuard::new(self.shared.clone(), backend.clone());
        GatewayMetrics::incr(&shared.metrics.forwarded);
        let forward = ForwardRequest::from_inbound(&selection.address, request);
        let forwarder = self.forwarder.clone();
        let result = shared.forward_timeout.run(forwarder.oneshot(forward)).await;

        // Report
        let outcome = match result {
            Ok(Ok(response)) if !response.is_server_error() => Ok(response),
            Ok(Ok(response)) => {
                warn!(target: "tollgate::dispatcher", backend = %backend, status = response.status, "backend answered with a server error");
                report.complete(false).await;
                return Ok(build_response(response, &selection.address, selection.degraded, quota));
            }
            Ok(Err(err)) => {
                warn!(target: "tollgate::dispatcher", backend = %backend, error = %err, "backend call failed");
                Err(GatewayError::Upstream { backend: backend.clone(), message: err.to_string() })
            }
            Err(timed_out) => {
                GatewayMetrics::incr(&shared.metrics.upstream_timeouts);
                warn!(target: "tollgate::dispatcher", backend = %backend, timeout = ?timed_out.limit, "backend call timed out");
                Err(GatewayError::UpstreamTimeout { backend: backend.clone(), timeout: timed_out.limit })
            }
        };
        report.complete(outcome.is_ok()).await;
        outcome.map(|response| build_response(response, &selection.address, selection.degraded, quota))
    }
}

fn build_response(
    response: ForwardResponse,
    backend: &str,
    degraded: bool,
    quota: Option<Quota>,
) -> GatewayResponse {
    let mut headers = response.headers;
    if let Some(quota) = quota {
        for (name, value) in quota.headers() {
            headers.insert(name.to_ascii_lowercase(), value);
        }
    }
    GatewayResponse {
        status: response.status,
        headers,
        body: response.body,
        backend: backend.to_string(),
        degraded,
    }
}

/// Reports the outcome of a forwarded call exactly once. If dropped before
/// [`complete`](Self::complete), the call was abandoned and counts as a failure.
struct ReportGuard {
    shared: Arc<Shared>,
    backend: BackendKey,
    started: Instant,
    done: bool,
}

impl ReportGuard {
    fn new(shared: Arc<Shared>, backend: BackendKey) -> Self {
        Self { shared, backend, started: Instant::now(), done: false }
    }

    async fn complete(&mut self, success: bool) {
        self.done = true;
        let latency = self.started.elapsed();
        let shared = &self.shared;
        shared.health.record(&self.backend, success, latency);
        shared
            .breakers
            .record_result(&self.backend.service, &self.backend.address, success, latency)
            .await;
        let outcome = if success {
            RequestOutcome::Success { backend: self.backend.clone(), duration: latency }
        } else {
            GatewayMetrics::incr(&shared.metrics.backend_errors);
            RequestOutcome::Failure { backend: self.backend.clone(), duration: latency }
        };
        shared.telemetry.emit(GatewayEvent::Request(outcome)).await;
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let latency = self.started.elapsed();
        let shared = &self.shared;
        GatewayMetrics::incr(&shared.metrics.cancelled);
        shared.health.record_failure(&self.backend);
        let transition = shared.breakers.breaker(&self.backend).record(false);
        warn!(target: "tollgate::dispatcher", backend = %self.backend, ?latency, "request cancelled before the backend answered");

        if shared.telemetry.is_noop() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let telemetry = shared.telemetry.clone();
        let backend = self.backend.clone();
        runtime.spawn(async move {
            if let Some(transition) = transition {
                telemetry.emit(transition_event(&backend, transition)).await;
            }
            telemetry
                .emit(GatewayEvent::Request(RequestOutcome::Cancelled { backend, duration: latency }))
                .await;
        });
    }
}

impl<F> Service<InboundRequest> for Gateway<F>
where
    F: Service<ForwardRequest, Response = ForwardResponse> + Clone + Send + Sync + 'static,
    F::Error: fmt::Display + Send,
    F::Future: Send,
{
    type Response = GatewayResponse;
    type Error = GatewayError;
    type Future = BoxFuture<'static, Result<GatewayResponse, GatewayError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: InboundRequest) -> Self::Future {
        let gateway = self.clone();
        Box::pin(async move { gateway.handle(request).await })
    }
}

impl<F> fmt::Debug for Gateway<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("services", &self.shared.registry.services().count())
            .field("backends", &self.shared.registry.backend_count())
            .field("limiter", &self.shared.limiter)
            .field("policy", &self.shared.policy)
            .field("forward_timeout", &self.shared.forward_timeout.duration())
            .finish()
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder<F> {
    config: GatewayConfig,
    forwarder: F,
    store: Option<Arc<dyn CounterStore>>,
    resolver: Arc<dyn IdentityResolver>,
    policy: LoadBalancePolicy,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl<F> GatewayBuilder<F> {
    /// Shared counter store. Without one, quotas are enforced per process.
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn policy(mut self, policy: LoadBalancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Clock for rate-limit windows, breaker cooldowns and health timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Result<Gateway<F>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(ServiceRegistry::new(&config.services));
        let rules = RuleSet::new(config.rules);
        let mut limiter = RateLimiter::builder(rules)
            .clock(self.clock.clone())
            .store_timeout(config.store_timeout)
            .telemetry(self.telemetry.clone());
        if let Some(store) = self.store {
            limiter = limiter.store(store);
        }
        let limiter = Arc::new(limiter.build()?);
        let breakers = Arc::new(
            BreakerRegistry::with_clock(config.breaker, self.clock.clone())
                .with_telemetry(self.telemetry.clone()),
        );
        let health = Arc::new(HealthTable::with_clock(&registry, self.clock));
        let balancer = LoadBalancer::new(registry.clone(), health.clone(), breakers.clone());

        debug!(
            target: "tollgate::dispatcher",
            services = registry.services().count(),
            backends = registry.backend_count(),
            rules = limiter.rules().total_count(),
            store = limiter.store_name(),
            "gateway built"
        );

        Ok(Gateway {
            shared: Arc::new(Shared {
                registry,
                limiter,
                breakers,
                health,
                balancer,
                resolver: self.resolver,
                policy: self.policy,
                forward_timeout: TimeoutPolicy::new("forward_timeout", config.forward_timeout)?,
                health_config: config.health,
                telemetry: self.telemetry,
                metrics: GatewayMetrics::default(),
            }),
            forwarder: self.forwarder,
        })
    }
}
