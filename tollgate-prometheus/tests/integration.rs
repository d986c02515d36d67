use prometheus::{Registry, TextEncoder};
use std::convert::Infallible;
use std::time::Duration;
use tollgate::config::GatewayConfig;
use tollgate::registry::BackendKey;
use tollgate::request::{ForwardRequest, ForwardResponse, InboundRequest};
use tollgate::telemetry::{
    AdmissionEvent, CircuitBreakerEvent, GatewayEvent, HealthEvent, RequestOutcome,
};
use tollgate::Gateway;
use tollgate_prometheus::{PrometheusSink, SnapshotGauges};
use tower_service::Service;

fn scrape(registry: &Registry) -> String {
    TextEncoder::new().encode_to_string(&registry.gather()).expect("encode metrics")
}

fn key() -> BackendKey {
    BackendKey::new("ml", "http://ml-1")
}

#[tokio::test]
async fn test_events_are_counted_by_component() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let events = [
        GatewayEvent::Admission(AdmissionEvent::Denied {
            rule_id: "ml".into(),
            retry_after: Duration::from_secs(3),
        }),
        GatewayEvent::Admission(AdmissionEvent::Denied {
            rule_id: "ml".into(),
            retry_after: Duration::from_secs(2),
        }),
        GatewayEvent::CircuitBreaker(CircuitBreakerEvent::Opened { backend: key(), failure_count: 5 }),
        GatewayEvent::Health(HealthEvent::Probed {
            backend: key(),
            healthy: false,
            latency: Duration::from_millis(4),
        }),
        GatewayEvent::Request(RequestOutcome::Cancelled { backend: key(), duration: Duration::ZERO }),
    ];
    for event in events {
        sink.call(event).await.expect("Failed to call sink");
    }

    let text = scrape(sink.registry());
    assert!(text.contains(r#"tollgate_events_total{component="rate_limiter",event="denied"} 2"#), "{text}");
    assert!(text.contains(r#"tollgate_events_total{component="circuit_breaker",event="opened"} 1"#));
    assert!(text.contains(r#"tollgate_events_total{component="health_checker",event="probe_failed"} 1"#));
    assert!(text.contains(r#"tollgate_events_total{component="request",event="cancelled"} 1"#));
}

#[test]
fn test_duplicate_registration_fails() {
    let registry = Registry::new();
    PrometheusSink::new(registry.clone()).expect("first registration");
    assert!(PrometheusSink::new(registry).is_err());
}

#[tokio::test]
async fn test_snapshot_gauges_follow_the_gateway() {
    let config = GatewayConfig::default().with_service("api", ["http://a", "http://b"]);
    let forwarder = tower::service_fn(|_req: ForwardRequest| async {
        Ok::<_, Infallible>(ForwardResponse::new(200))
    });
    let gateway = Gateway::builder(config, forwarder).build().expect("gateway");
    gateway.handle(InboundRequest::new("api", "GET", "/")).await.expect("forwarded");

    let registry = Registry::new();
    let gauges = SnapshotGauges::new(&registry).expect("gauges");
    gauges.observe(&gateway.snapshot());

    let text = scrape(&registry);
    assert!(text.contains(r#"tollgate_requests{outcome="requests"} 1"#), "{text}");
    assert!(text.contains(r#"tollgate_requests{outcome="forwarded"} 1"#));
    assert!(text.contains(r#"tollgate_backend_healthy{backend="http://a",service="api"} 1"#));
    assert!(text.contains(r#"tollgate_backend_breaker_state{backend="http://b",service="api"} 0"#));
    assert!(text.contains("tollgate_health_ratio 1"));
    // Only the backend that served traffic has a latency.
    assert!(text.contains(r#"tollgate_backend_latency_ms{backend="http://a",service="api"}"#));
    assert!(!text.contains(r#"tollgate_backend_latency_ms{backend="http://b",service="api"}"#));
}

#[tokio::test]
async fn test_gateway_events_reach_prometheus_off_the_request_path() {
    use std::sync::Arc;
    use std::time::Duration;
    use tollgate::config::{RateLimitRule, ScopeKind};
    use tollgate::telemetry::{NonBlockingSink, Telemetry};
    use tollgate::ManualClock;

    let registry = Registry::new();
    let sink = PrometheusSink::new(registry.clone()).expect("sink");
    let exporter = NonBlockingSink::with_capacity(sink, 64);
    let config = GatewayConfig::default()
        .with_service("api", ["http://a"])
        .with_rule(RateLimitRule::new("global", ScopeKind::Global, 1, Duration::from_secs(60)));
    let forwarder = tower::service_fn(|_req: ForwardRequest| async {
        Ok::<_, Infallible>(ForwardResponse::new(200))
    });
    let gateway = Gateway::builder(config, forwarder)
        .clock(Arc::new(ManualClock::new(1_000_000)))
        .telemetry(Telemetry::new(exporter.clone()))
        .build()
        .expect("gateway");

    gateway.handle(InboundRequest::new("api", "GET", "/")).await.expect("admitted");
    assert!(gateway.handle(InboundRequest::new("api", "GET", "/")).await.is_err());

    let denied = r#"tollgate_events_total{component="rate_limiter",event="denied"} 1"#;
    for _ in 0..100 {
        if scrape(&registry).contains(denied) {
            break;
        }
        tokio::task::yield_now().await;
    }
    let text = scrape(&registry);
    assert!(text.contains(denied), "{text}");
    assert!(text.contains(r#"tollgate_events_total{component="request",event="success"} 1"#));
    assert_eq!(exporter.dropped(), 0);
}
