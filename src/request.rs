//! Request and response types flowing through the gateway.
//!
//! The gateway is transport-agnostic: a front-end (HTTP server, RPC adapter)
//! converts its wire request into an [`InboundRequest`] and renders the
//! [`GatewayResponse`] or [`GatewayError`](crate::GatewayError) back.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, String>;

/// A caller request addressed to a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundRequest {
    pub service: String,
    pub method: String,
    /// Path below the service, used for rule matching and forwarded verbatim.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub client_ip: Option<IpAddr>,
}

impl InboundRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup. Blank values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// The proxied call handed to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    /// Backend base address, e.g. `http://ml-1:8000`.
    pub backend: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ForwardRequest {
    pub(crate) fn from_inbound(backend: &str, request: InboundRequest) -> Self {
        Self {
            backend: backend.to_string(),
            method: request.method,
            path: request.path,
            query: request.query,
            headers: request.headers,
            body: request.body,
        }
    }

    /// Backend address joined with path and query.
    pub fn url(&self) -> String {
        let mut url = String::with_capacity(self.backend.len() + self.path.len() + 1);
        url.push_str(self.backend.trim_end_matches('/'));
        if !self.path.starts_with('/') {
            url.push('/');
        }
        url.push_str(&self.path);
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// What the backend answered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ForwardResponse {
    pub fn new(status: u16) -> Self {
        Self { status, ..Self::default() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Server-side failure. Passed through to the caller but counted against the backend.
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Successful gateway answer: the backend response plus routing and quota metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    /// Backend headers followed by the gateway's own (`X-RateLimit-*`).
    pub headers: Headers,
    pub body: Vec<u8>,
    pub backend: String,
    /// The load balancer had no healthy candidate and fell back to the first backend.
    pub degraded: bool,
}
