mod common;

use async_trait::async_trait;
use common::test_helpers::ScriptedForwarder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::config::{GatewayConfig, RateLimitRule, ScopeKind};
use tollgate::rate_limit::{CounterStore, InMemoryCounterStore, WindowAdmission};
use tollgate::request::InboundRequest;
use tollgate::telemetry::{AdmissionEvent, GatewayEvent, MemorySink, Telemetry};
use tollgate::{Gateway, StoreError};

/// Wraps the in-memory store and can be switched off or made to stall.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: InMemoryCounterStore,
    down: AtomicBool,
    stall: AtomicBool,
}

impl FlakyStore {
    async fn check(&self) -> Result<(), StoreError> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn remove_older_than(&self, key: &str, threshold_millis: u64) -> Result<(), StoreError> {
        self.check().await?;
        self.inner.remove_older_than(key, threshold_millis).await
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        self.check().await?;
        self.inner.count(key).await
    }

    async fn add_if_under_limit(
        &self,
        key: &str,
        member: &str,
        at_millis: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission, StoreError> {
        self.check().await?;
        self.inner.add_if_under_limit(key, member, at_millis, limit, ttl).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn gateway(store: Arc<FlakyStore>, sink: MemorySink) -> Gateway<ScriptedForwarder> {
    let mut config = GatewayConfig::default()
        .with_service("api", ["http://api-1"])
        .with_rule(RateLimitRule::new("global", ScopeKind::Global, 2, Duration::from_secs(60)));
    config.store_timeout = Duration::from_millis(100);
    Gateway::builder(config, ScriptedForwarder::new())
        .counter_store(store)
        .telemetry(Telemetry::new(sink))
        .build()
        .unwrap()
}

fn request() -> InboundRequest {
    InboundRequest::new("api", "GET", "/")
}

#[tokio::test]
async fn store_outage_admits_everything_and_recovers() {
    let store = Arc::new(FlakyStore::default());
    let sink = MemorySink::new();
    let gateway = gateway(store.clone(), sink.clone());

    assert!(gateway.handle(request()).await.is_ok());

    store.down.store(true, Ordering::SeqCst);
    for _ in 0..5 {
        let response = gateway.handle(request()).await.expect("fails open");
        assert!(response.headers.get("x-ratelimit-limit").is_none());
    }
    let fail_opens = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, GatewayEvent::Admission(AdmissionEvent::FailOpen { .. })))
        .count();
    assert_eq!(fail_opens, 5);

    // Back up: the one request recorded before the outage still counts.
    store.down.store(false, Ordering::SeqCst);
    assert!(gateway.handle(request()).await.is_ok());
    assert!(gateway.handle(request()).await.unwrap_err().is_quota_exceeded());

    let snapshot = gateway.snapshot();
    assert_eq!(snapshot.counter_store, "flaky");
    assert_eq!(snapshot.totals.store_failures, 5);
    assert_eq!(snapshot.totals.denied, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_store_is_bounded_by_the_store_timeout() {
    let store = Arc::new(FlakyStore::default());
    store.stall.store(true, Ordering::SeqCst);
    let gateway = gateway(store, MemorySink::new());

    let started = tokio::time::Instant::now();
    for _ in 0..3 {
        assert!(gateway.handle(request()).await.is_ok());
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(gateway.limiter().stats().store_failures, 3);
}
