//! HTTP plumbing for `tollgate` over reqwest.
//!
//! - [`HttpForwarder`]: a `tower_service::Service<ForwardRequest>` that proxies
//!   the admitted request to the chosen backend.
//! - [`HttpProbe`]: a [`HealthProbe`] issuing `GET {backend}{path}`.
//!
//! Both share one connection pool when built from the same `reqwest::Client`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::task::{Context, Poll};
use thiserror::Error;
use tollgate::error::ProbeError;
use tollgate::health_checker::HealthProbe;
use tollgate::request::{ForwardRequest, ForwardResponse, Headers};
use tracing::{debug, trace};

/// Headers that describe the hop, not the request. Never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Proxies [`ForwardRequest`]s over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn build(&self, req: &ForwardRequest) -> Result<reqwest::Request, ForwardError> {
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(req.method.clone()))?;
        let url = req.url();
        let headers = header_map(&req.headers)?;
        self.client
            .request(method, &url)
            .headers(headers)
            .body(req.body.clone())
            .build()
            .map_err(|source| ForwardError::Request { url, source })
    }
}

fn header_map(headers: &Headers) -> Result<HeaderMap, ForwardError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ForwardError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ForwardError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn headers_from(map: &HeaderMap) -> Headers {
    map.iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

impl tower_service::Service<ForwardRequest> for HttpForwarder {
    type Response = ForwardResponse;
    type Error = ForwardError;
    type Future = BoxFuture<'static, Result<ForwardResponse, ForwardError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ForwardRequest) -> Self::Future {
        let client = self.client.clone();
        let built = self.build(&req);
        Box::pin(async move {
            let request = built?;
            let url = request.url().to_string();
            trace!(target: "tollgate::http", method = %request.method(), %url, "forwarding");
            let response = client
                .execute(request)
                .await
                .map_err(|source| ForwardError::Request { url: url.clone(), source })?;
            let status = response.status().as_u16();
            let headers = headers_from(response.headers());
            let body = response
                .bytes()
                .await
                .map_err(|source| ForwardError::Request { url, source })?;
            Ok(ForwardResponse { status, headers, body: body.to_vec() })
        })
    }
}

/// Health probe answering healthy when `GET {backend}{path}` returns the
/// expected status (200 unless configured).
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    expected_status: u16,
}

impl HttpProbe {
    pub fn new(client: Client) -> Self {
        Self { client, expected_status: 200 }
    }

    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, backend: &str, path: &str) -> Result<(), ProbeError> {
        let url = format!("{}/{}", backend.trim_end_matches('/'), path.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let actual = response.status().as_u16();
        debug!(target: "tollgate::http", %url, status = actual, "health probe answered");
        if actual == self.expected_status {
            Ok(())
        } else {
            Err(ProbeError::Status { expected: self.expected_status, actual })
        }
    }
}
