//! Prometheus metrics for `tollgate`.
//! Bring your own `prometheus::Registry`; event counters and snapshot gauges
//! are registered into it.

use prometheus::{Gauge, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::circuit_breaker::CircuitState;
use tollgate::snapshot::GatewaySnapshot;
use tollgate::telemetry::{
    AdmissionEvent, CircuitBreakerEvent, GatewayEvent, HealthEvent, RequestOutcome,
    SelectionEvent, TelemetrySink,
};

/// Counts every [`GatewayEvent`] by component and event name.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            Opts::new("tollgate_events_total", "Gateway events"),
            &["component", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn labels(event: &GatewayEvent) -> (&'static str, &'static str) {
    match event {
        GatewayEvent::Admission(a) => (
            "rate_limiter",
            match a {
                AdmissionEvent::Admitted { .. } => "admitted",
                AdmissionEvent::Denied { .. } => "denied",
                AdmissionEvent::FailOpen { .. } => "fail_open",
            },
        ),
        GatewayEvent::CircuitBreaker(c) => (
            "circuit_breaker",
            match c {
                CircuitBreakerEvent::Opened { .. } => "opened",
                CircuitBreakerEvent::HalfOpen { .. } => "half_open",
                CircuitBreakerEvent::Closed { .. } => "closed",
            },
        ),
        GatewayEvent::Selection(SelectionEvent::Degraded { .. }) => ("load_balancer", "degraded"),
        GatewayEvent::Health(HealthEvent::Probed { healthy, .. }) => {
            ("health_checker", if *healthy { "probe_ok" } else { "probe_failed" })
        }
        GatewayEvent::Request(r) => (
            "request",
            match r {
                RequestOutcome::Success { .. } => "success",
                RequestOutcome::Failure { .. } => "failure",
                RequestOutcome::Cancelled { .. } => "cancelled",
            },
        ),
    }
}

impl tower_service::Service<GatewayEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        let (component, name) = labels(&event);
        self.counter.with_label_values(&[component, name]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}

/// Gauges mirroring a [`GatewaySnapshot`]. Call [`observe`](Self::observe)
/// from a scrape handler or a periodic task.
#[derive(Clone, Debug)]
pub struct SnapshotGauges {
    totals: IntGaugeVec,
    backend_healthy: IntGaugeVec,
    backend_breaker: IntGaugeVec,
    backend_latency: IntGaugeVec,
    block_rate: Gauge,
    health_ratio: Gauge,
}

impl SnapshotGauges {
    /// # Errors
    /// Returns an error if a gauge cannot be registered.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let backend = &["service", "backend"];
        let gauges = Self {
            totals: IntGaugeVec::new(
                Opts::new("tollgate_requests", "Cumulative request totals by outcome"),
                &["outcome"],
            )?,
            backend_healthy: IntGaugeVec::new(
                Opts::new("tollgate_backend_healthy", "1 when the backend is healthy"),
                backend,
            )?,
            backend_breaker: IntGaugeVec::new(
                Opts::new(
                    "tollgate_backend_breaker_state",
                    "Breaker state: 0 closed, 1 half-open, 2 open",
                ),
                backend,
            )?,
            backend_latency: IntGaugeVec::new(
                Opts::new("tollgate_backend_latency_ms", "Last observed latency"),
                backend,
            )?,
            block_rate: Gauge::new("tollgate_block_rate", "Denied over requests seen")?,
            health_ratio: Gauge::new("tollgate_health_ratio", "Healthy over registered backends")?,
        };
        registry.register(Box::new(gauges.totals.clone()))?;
        registry.register(Box::new(gauges.backend_healthy.clone()))?;
        registry.register(Box::new(gauges.backend_breaker.clone()))?;
        registry.register(Box::new(gauges.backend_latency.clone()))?;
        registry.register(Box::new(gauges.block_rate.clone()))?;
        registry.register(Box::new(gauges.health_ratio.clone()))?;
        Ok(gauges)
    }

    pub fn observe(&self, snapshot: &GatewaySnapshot) {
        let t = &snapshot.totals;
        let totals = [
            ("requests", t.requests),
            ("denied", t.denied),
            ("store_failures", t.store_failures),
            ("no_backend", t.no_backend),
            ("breaker_rejections", t.breaker_rejections),
            ("degraded_selections", t.degraded_selections),
            ("forwarded", t.forwarded),
            ("backend_errors", t.backend_errors),
            ("upstream_timeouts", t.upstream_timeouts),
            ("cancelled", t.cancelled),
        ];
        for (outcome, value) in totals {
            self.totals.with_label_values(&[outcome]).set(saturate(value));
        }

        for b in &snapshot.backends {
            let labels = [b.service.as_str(), b.address.as_str()];
            self.backend_healthy.with_label_values(&labels).set(i64::from(b.healthy));
            let state = match b.breaker_state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            self.backend_breaker.with_label_values(&labels).set(state);
            match b.latency_ms {
                Some(ms) => self.backend_latency.with_label_values(&labels).set(saturate(ms)),
                None => {
                    // Never measured; drop any stale series.
                    let _ = self.backend_latency.remove_label_values(&labels);
                }
            }
        }
        self.block_rate.set(snapshot.block_rate);
        self.health_ratio.set(snapshot.health_ratio);
        tracing::trace!(backends = snapshot.backends.len(), "snapshot gauges updated");
    }
}

fn saturate(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
