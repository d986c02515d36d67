//! Built-in event sinks. Each is a cheap-to-clone `tower::Service<GatewayEvent>`.

use super::events::GatewayEvent;
use futures::future::{self, BoxFuture, Ready};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tower::{Service, ServiceExt};

/// A `Service<GatewayEvent>` that can sit behind a [`Telemetry`](super::Telemetry) handle.
pub trait TelemetrySink:
    Service<GatewayEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Wait for the sink to be ready, deliver one event, and drop any error.
pub async fn emit_best_effort<S>(sink: S, event: GatewayEvent)
where
    S: Service<GatewayEvent, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut sink) = sink.ready_oneshot().await {
        let _ = sink.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<GatewayEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GatewayEvent) -> Self::Future {
        future::ok(())
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event as one `info!` line under `tollgate::telemetry`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<GatewayEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        tracing::info!(target: "tollgate::telemetry", %event, "gateway event");
        future::ok(())
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in a bounded ring; clones share it.
#[derive(Clone, Debug)]
pub struct MemorySink {
    ring: Arc<Mutex<VecDeque<GatewayEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<GatewayEvent>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.ring().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    pub fn clear(&self) {
        self.ring().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events pushed out because the ring was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GatewayEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        let mut ring = self.ring();
        if ring.len() == self.capacity {
            ring.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
        future::ok(())
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Hands events to a background task through a bounded channel, so a slow
/// exporter never holds up a request. When the channel is full the event is
/// dropped and counted.
///
/// Must be created inside a Tokio runtime. The task ends once every clone is gone.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: mpsc::Sender<GatewayEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: Service<GatewayEvent, Response = ()> + Clone + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink")
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Service<GatewayEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(future::ok(()))
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendKey;
    use crate::telemetry::events::{AdmissionEvent, CircuitBreakerEvent, SelectionEvent};
    use std::time::Duration;

    fn denied() -> GatewayEvent {
        GatewayEvent::Admission(AdmissionEvent::Denied {
            rule_id: "r".into(),
            retry_after: Duration::from_secs(1),
        })
    }

    fn opened() -> GatewayEvent {
        GatewayEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            backend: BackendKey::new("svc", "a"),
            failure_count: 5,
        })
    }

    fn degraded() -> GatewayEvent {
        GatewayEvent::Selection(SelectionEvent::Degraded { backend: BackendKey::new("svc", "a") })
    }

    #[tokio::test]
    async fn memory_sink_keeps_the_newest_events() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        for event in [denied(), opened(), degraded()] {
            sink.call(event).await.unwrap();
        }
        assert_eq!(sink.events(), vec![opened(), degraded()]);
        assert_eq!(sink.evicted(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_everything() {
        NullSink.call(denied()).await.unwrap();
        LogSink.call(opened()).await.unwrap();
    }

    #[tokio::test]
    async fn non_blocking_sink_delivers_from_a_background_task() {
        let memory = MemorySink::new();
        let mut sink = NonBlockingSink::with_capacity(memory.clone(), 8);
        sink.call(opened()).await.unwrap();

        for _ in 0..50 {
            if !memory.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.events(), vec![opened()]);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn non_blocking_sink_drops_when_full() {
        let mut sink = NonBlockingSink::with_capacity(MemorySink::new(), 1);
        // Nothing has been drained yet on this single-threaded runtime.
        sink.call(denied()).await.unwrap();
        sink.call(opened()).await.unwrap();
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        #[derive(Clone)]
        struct Broken;

        impl Service<GatewayEvent> for Broken {
            type Response = ();
            type Error = std::io::Error;
            type Future = Ready<Result<(), std::io::Error>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _event: GatewayEvent) -> Self::Future {
                future::err(std::io::Error::other("exporter down"))
            }
        }

        emit_best_effort(Broken, denied()).await;
    }
}
