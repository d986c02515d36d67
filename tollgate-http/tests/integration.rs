use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tollgate::config::GatewayConfig;
use tollgate::error::ProbeError;
use tollgate::health_checker::HealthProbe;
use tollgate::request::InboundRequest;
use tollgate::Gateway;
use tollgate_http::{HttpForwarder, HttpProbe};

/// Accept one connection, answer with `response`, and hand back the raw request head.
async fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = format!("http://{}", listener.local_addr().expect("addr"));
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.expect("read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        socket.write_all(response.as_bytes()).await.expect("write");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&buf).into_owned()
    });
    (addr, handle)
}

#[tokio::test]
async fn probe_accepts_200() {
    let (addr, server) =
        serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
    HttpProbe::default().probe(&addr, "/health").await.expect("healthy");
    let head = server.await.unwrap();
    assert!(head.starts_with("GET /health HTTP/1.1"), "{head}");
}

#[tokio::test]
async fn probe_rejects_other_statuses() {
    let (addr, _server) = serve_once(
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
    )
    .await;
    let err = HttpProbe::default().probe(&addr, "health").await.unwrap_err();
    assert_eq!(err, ProbeError::Status { expected: 200, actual: 503 });
}

#[tokio::test]
async fn probe_reports_refused_connections_as_transport_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let err = HttpProbe::default().probe(&addr, "/health").await.unwrap_err();
    assert!(matches!(err, ProbeError::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn gateway_forwards_over_http() {
    let (addr, server) = serve_once(
        "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-backend: one\r\nconnection: close\r\n\r\nhello",
    )
    .await;
    let config = GatewayConfig::default().with_service("api", [addr.clone()]);
    let gateway = Gateway::builder(config, HttpForwarder::default()).build().unwrap();

    let request = InboundRequest::new("api", "GET", "/items")
        .with_query("page=2")
        .with_header("X-User-Id", "u1")
        .with_header("Host", "gateway.example");
    let response = gateway.handle(request).await.expect("forwarded");

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
    assert_eq!(response.backend, addr);
    assert_eq!(response.headers.get("x-backend").map(String::as_str), Some("one"));

    let head = server.await.unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /items?page=2 http/1.1"), "{head}");
    assert!(head.contains("x-user-id: u1"));
    assert!(!head.contains("gateway.example"));
}

#[tokio::test]
async fn unreachable_backend_is_an_upstream_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let config = GatewayConfig::default().with_service("api", [addr]);
    let gateway = Gateway::builder(config, HttpForwarder::default()).build().unwrap();

    let err = gateway.handle(InboundRequest::new("api", "GET", "/")).await.unwrap_err();
    assert_eq!(err.status_code(), 502);
    let probe: Arc<dyn HealthProbe> = Arc::new(HttpProbe::default());
    assert!(gateway.health_checker(probe).is_ok());
}
