//! Periodic active health checking.
//!
//! Every interval, each registered backend is probed in its own task. A probe
//! that errors, times out or panics marks only its own backend unhealthy and
//! counts as a breaker failure; it never delays the other probes or the next
//! round. A backend whose previous probe is still running is skipped for that
//! round instead of being probed twice.
//!
//! ```rust,no_run
//! # use tollgate::health_checker::HealthChecker;
//! # async fn run(checker: HealthChecker) {
//! let handle = checker.start();
//! // ... serve traffic ...
//! handle.stop().await;
//! # }
//! ```

use crate::circuit_breaker_registry::BreakerRegistry;
use crate::config::{ConfigError, HealthCheckConfig};
use crate::error::ProbeError;
use crate::health::HealthTable;
use crate::registry::{BackendKey, ServiceRegistry};
use crate::telemetry::{GatewayEvent, HealthEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Checks one backend. Implementations should be cheap; the checker applies the
/// probe timeout itself.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    /// `backend` is the registered address, `path` the configured health path.
    async fn probe(&self, backend: &str, path: &str) -> Result<(), ProbeError>;
}

/// Result of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub backend: BackendKey,
    pub latency: Duration,
    pub result: Result<(), ProbeError>,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        self.result.is_ok()
    }
}

/// Summary of one full probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub outcomes: Vec<ProbeOutcome>,
}

impl RoundReport {
    pub fn healthy(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_healthy()).count()
    }

    pub fn unhealthy(&self) -> usize {
        self.outcomes.len() - self.healthy()
    }
}

/// Probes every registered backend and feeds the results into the health table
/// and the breakers.
#[derive(Clone)]
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthTable>,
    breakers: Arc<BreakerRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    probe_timeout: TimeoutPolicy,
    path: Arc<str>,
    telemetry: Telemetry,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthTable>,
        breakers: Arc<BreakerRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: &HealthCheckConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry,
            health,
            breakers,
            probe,
            interval: config.interval,
            probe_timeout: TimeoutPolicy::new("health.probe_timeout", config.probe_timeout)?,
            path: Arc::from(config.path.as_str()),
            telemetry: Telemetry::noop(),
        })
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every backend once, concurrently, and wait for all of them.
    pub async fn run_once(&self) -> RoundReport {
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();
        for backend in self.registry.keys() {
            let handle = tasks.spawn(self.clone().check(backend.clone()));
            spawned.insert(handle.id(), backend);
        }
        let mut outcomes = Vec::with_capacity(self.registry.backend_count());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(err) => {
                    if let Some(backend) = spawned.remove(&err.id()) {
                        outcomes.push(self.check_task_failed(backend, &err).await);
                    }
                }
            }
        }
        outcomes.sort_by(|a, b| a.backend.cmp(&b.backend));
        RoundReport { outcomes }
    }

    /// Start the background worker. It runs until [`HealthCheckerHandle::stop`]
    /// is called or the handle is dropped. Must be called inside a Tokio runtime.
    pub fn start(self) -> HealthCheckerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.supervise(shutdown_rx));
        HealthCheckerHandle { shutdown: shutdown_tx, task }
    }

    async fn supervise(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "tollgate::health",
            backends = self.registry.backend_count(),
            interval = ?self.interval,
            "health checker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<ProbeOutcome> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, BackendKey> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for backend in self.registry.keys() {
                        if in_flight.values().any(|running| running == &backend) {
                            debug!(target: "tollgate::health", backend = %backend, "previous probe still running; skipped");
                            continue;
                        }
                        let handle = tasks.spawn(self.clone().check(backend.clone()));
                        in_flight.insert(handle.id(), backend);
                    }
                }
                Some(joined) = tasks.join_next_with_id() => {
                    match joined {
                        Ok((id, _)) => {
                            in_flight.remove(&id);
                        }
                        Err(err) => {
                            if let Some(backend) = in_flight.remove(&err.id()) {
                                self.check_task_failed(backend, &err).await;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tasks.shutdown().await;
        info!(target: "tollgate::health", "health checker stopped");
    }

    async fn check(self, backend: BackendKey) -> ProbeOutcome {
        let start = Instant::now();
        let probe = self.probe.probe(&backend.address, &self.path);
        let result = match AssertUnwindSafe(self.probe_timeout.run(probe)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(timed_out)) => Err(ProbeError::Timeout(timed_out.limit)),
            Err(_) => {
                error!(target: "tollgate::health", backend = %backend, "health probe panicked");
                Err(ProbeError::Panicked)
            }
        };
        let latency = start.elapsed();
        let healthy = result.is_ok();

        let was_healthy = self.health.get(&backend).map_or(true, |h| h.healthy);
        self.health.record(&backend, healthy, latency);
        self.breakers.record_result(&backend.service, &backend.address, healthy, latency).await;

        match (&result, was_healthy) {
            (Err(err), true) => {
                warn!(target: "tollgate::health", backend = %backend, error = %err, "backend became unhealthy")
            }
            (Ok(()), false) => {
                info!(target: "tollgate::health", backend = %backend, ?latency, "backend recovered")
            }
            _ => debug!(target: "tollgate::health", backend = %backend, healthy, ?latency, "probe finished"),
        }
        self.telemetry
            .emit(GatewayEvent::Health(HealthEvent::Probed {
                backend: backend.clone(),
                healthy,
                latency,
            }))
            .await;

        ProbeOutcome { backend, latency, result }
    }

    /// A check task died outside the probe itself. The backend counts as failed
    /// and is probed again next round.
    async fn check_task_failed(&self, backend: BackendKey, err: &task::JoinError) -> ProbeOutcome {
        error!(target: "tollgate::health", backend = %backend, error = %err, "health check task failed");
        self.health.record(&backend, false, Duration::ZERO);
        self.breakers.record_result(&backend.service, &backend.address, false, Duration::ZERO).await;
        ProbeOutcome { backend, latency: Duration::ZERO, result: Err(ProbeError::Panicked) }
    }
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("backends", &self.registry.backend_count())
            .field("interval", &self.interval)
            .field("probe_timeout", &self.probe_timeout.duration())
            .field("path", &self.path)
            .finish()
    }
}

/// Controls a running health checker. Dropping the handle also stops the worker.
#[derive(Debug)]
pub struct HealthCheckerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthCheckerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal shutdown, abort in-flight probes and wait for the worker to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(target: "tollgate::health", error = %err, "health checker worker ended abnormally");
        }
    }
}
