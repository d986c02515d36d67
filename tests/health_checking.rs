mod common;

use async_trait::async_trait;
use common::test_helpers::{Reply, ScriptedForwarder};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::config::GatewayConfig;
use tollgate::error::ProbeError;
use tollgate::health_checker::HealthProbe;
use tollgate::request::InboundRequest;
use tollgate::telemetry::{GatewayEvent, HealthEvent, MemorySink, Telemetry};
use tollgate::{BackendKey, Gateway};

const A: &str = "http://a";
const B: &str = "http://b";

/// Answers 200 unless the backend is marked down.
#[derive(Debug, Default)]
struct SwitchProbe {
    down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl SwitchProbe {
    fn set_down(&self, backend: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(backend.to_string());
        } else {
            set.remove(backend);
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn probe(&self, backend: &str, path: &str) -> Result<(), ProbeError> {
        assert_eq!(path, "/health");
        self.calls.lock().unwrap().push(backend.to_string());
        if self.down.lock().unwrap().contains(backend) {
            Err(ProbeError::Status { expected: 200, actual: 503 })
        } else {
            Ok(())
        }
    }
}

fn gateway(forwarder: ScriptedForwarder, sink: MemorySink) -> Gateway<ScriptedForwarder> {
    let config = GatewayConfig::default().with_service("svc", [A, B]);
    Gateway::builder(config, forwarder).telemetry(Telemetry::new(sink)).build().unwrap()
}

fn request() -> InboundRequest {
    InboundRequest::new("svc", "GET", "/")
}

#[tokio::test]
async fn probe_round_steers_routing() {
    let probe = Arc::new(SwitchProbe::default());
    let sink = MemorySink::new();
    let gateway = gateway(ScriptedForwarder::new(), sink.clone());
    let checker = gateway.health_checker(probe.clone()).unwrap();

    probe.set_down(A, true);
    let report = checker.run_once().await;
    assert_eq!(report.healthy(), 1);
    assert_eq!(report.unhealthy(), 1);
    assert_eq!(gateway.handle(request()).await.unwrap().backend, B);

    let probed = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, GatewayEvent::Health(HealthEvent::Probed { .. })))
        .count();
    assert_eq!(probed, 2);

    probe.set_down(A, false);
    checker.run_once().await;
    let a = gateway.health().get(&BackendKey::new("svc", A)).unwrap();
    assert!(a.healthy);
    assert_eq!(a.consecutive_errors, 0);
    assert!(a.last_checked_millis.is_some());
}

#[tokio::test(start_paused = true)]
async fn background_checker_runs_every_interval_until_stopped() {
    let probe = Arc::new(SwitchProbe::default());
    let gateway = gateway(ScriptedForwarder::new(), MemorySink::new());
    let checker = gateway.health_checker(probe.clone()).unwrap();
    assert_eq!(checker.interval(), Duration::from_secs(30));

    probe.set_down(B, true);
    let handle = checker.start();
    // First tick fires immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(probe.calls(), 2);
    assert!(!gateway.health().get(&BackendKey::new("svc", B)).unwrap().healthy);

    probe.set_down(B, false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.calls(), 4);
    assert!(gateway.health().get(&BackendKey::new("svc", B)).unwrap().healthy);

    assert!(handle.is_running());
    handle.stop().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(probe.calls(), 4, "no probes after stop");
}

#[tokio::test]
async fn request_outcome_and_probe_share_one_health_view() {
    let forwarder = ScriptedForwarder::new();
    forwarder.set(A, Reply::Status(500));
    let probe = Arc::new(SwitchProbe::default());
    let config = GatewayConfig::default().with_service("svc", [A]);
    let gateway = Gateway::builder(config, forwarder).build().unwrap();
    let checker = gateway.health_checker(probe).unwrap();
    let a = BackendKey::new("svc", A);

    // A 500 marks A unhealthy; the next passing probe marks it healthy again.
    assert_eq!(gateway.handle(request()).await.unwrap().status, 500);
    assert!(!gateway.health().get(&a).unwrap().healthy);
    checker.run_once().await;
    assert!(gateway.health().get(&a).unwrap().healthy);

    // Last writer wins the other way too.
    assert_eq!(gateway.handle(request()).await.unwrap().status, 500);
    assert!(!gateway.health().get(&a).unwrap().healthy);
}

#[tokio::test]
async fn failing_probes_trip_the_breaker() {
    let probe = Arc::new(SwitchProbe::default());
    probe.set_down(A, true);
    let gateway = gateway(ScriptedForwarder::new(), MemorySink::new());
    let checker = gateway.health_checker(probe).unwrap();

    for _ in 0..5 {
        checker.run_once().await;
    }
    let a = BackendKey::new("svc", A);
    assert_eq!(gateway.breakers().state(&a), tollgate::CircuitState::Open);
    assert_eq!(gateway.health().get(&a).unwrap().consecutive_errors, 5);
}
