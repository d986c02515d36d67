//! Telemetry for the gateway.
//!
//! Components emit [`GatewayEvent`]s for behaviour the caller never sees
//! directly: fail-open admissions, degraded routing, breaker transitions and
//! probe results. Events flow through `TelemetrySink` implementations, which are
//! plain `tower::Service<GatewayEvent>`s so they compose like any other service.
//!
//! The gateway holds sinks behind a type-erased, cloneable [`Telemetry`] handle.
//! Emission is best-effort: sink errors are swallowed and never reach the
//! request path.

pub mod events;
pub mod sinks;

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub use events::{
    event_to_json, AdmissionEvent, CircuitBreakerEvent, GatewayEvent, HealthEvent,
    RequestOutcome, SelectionEvent,
};
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, NonBlockingSink, NullSink, TelemetrySink,
};

type EmitFn = dyn Fn(GatewayEvent) -> BoxFuture<'static, ()> + Send + Sync;

/// Cloneable handle over any [`TelemetrySink`].
#[derive(Clone)]
pub struct Telemetry {
    emit: Option<Arc<EmitFn>>,
}

impl Telemetry {
    /// Wrap a sink. Each emitted event drives one best-effort call on a clone of it.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        let emit = move |event: GatewayEvent| -> BoxFuture<'static, ()> {
            Box::pin(emit_best_effort(sink.clone(), event))
        };
        Self { emit: Some(Arc::new(emit)) }
    }

    /// A handle that drops every event without allocating.
    pub fn noop() -> Self {
        Self { emit: None }
    }

    pub fn is_noop(&self) -> bool {
        self.emit.is_none()
    }

    pub async fn emit(&self, event: GatewayEvent) {
        if let Some(emit) = &self.emit {
            emit(event).await;
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").field("noop", &self.is_noop()).finish()
    }
}
