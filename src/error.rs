//! Error types for the gateway.
//!
//! [`GatewayError`] is what a caller of the dispatcher sees. Counter-store and
//! probe failures ([`StoreError`], [`ProbeError`]) are absorbed internally: the
//! limiter turns store errors into fail-open admissions and the health checker
//! turns probe errors into unhealthy observations.
use crate::rate_limit::Quota;
use crate::registry::BackendKey;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Caller-visible failures of one gateway request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The caller exceeded the quota of the matching rule. Expected, not a fault.
    #[error("rate limit exceeded for rule {rule_id} (limit {}, retry after {:?})", quota.limit, retry_after)]
    QuotaExceeded { rule_id: String, quota: Quota, retry_after: Duration },
    /// The service is unknown or has no registered backends.
    #[error("no healthy backend for service {service}")]
    NoHealthyBackend { service: String },
    /// The selected backend's breaker rejected the call before any network I/O.
    #[error("circuit breaker open for {backend} ({failure_count} consecutive failures, open for {open_for:?})")]
    BreakerOpen { backend: BackendKey, failure_count: usize, open_for: Duration },
    /// The backend call failed. Already recorded into health and breaker state.
    #[error("upstream {backend} failed: {message}")]
    Upstream { backend: BackendKey, message: String },
    /// The backend did not answer within the forward timeout.
    #[error("upstream {backend} timed out after {timeout:?}")]
    UpstreamTimeout { backend: BackendKey, timeout: Duration },
}

impl GatewayError {
    /// HTTP status a front-end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::QuotaExceeded { .. } => 429,
            Self::NoHealthyBackend { .. } | Self::BreakerOpen { .. } => 503,
            Self::Upstream { .. } => 502,
            Self::UpstreamTimeout { .. } => 504,
        }
    }

    /// Stable machine-readable reason. Distinguishes an empty service from a
    /// service whose backends are all failing.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "rate_limit_exceeded",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::BreakerOpen { .. } => "circuit_open",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    pub fn is_no_healthy_backend(&self) -> bool {
        matches!(self, Self::NoHealthyBackend { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    /// Backend call failed or timed out.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::UpstreamTimeout { .. })
    }

    /// Time the caller should wait before retrying, if the gateway knows it.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Structured body for the caller.
    pub fn rejection(&self) -> Rejection {
        let (quota, retry_after) = match self {
            Self::QuotaExceeded { quota, retry_after, .. } => (Some(quota), Some(*retry_after)),
            _ => (None, None),
        };
        Rejection {
            error: self.reason(),
            message: self.to_string(),
            status: self.status_code(),
            limit: quota.map(|q| q.limit),
            remaining: quota.map(|q| q.remaining),
            reset_at: quota.map(|q| q.reset_at_secs()),
            retry_after: retry_after.map(ceil_secs),
        }
    }
}

/// Serialisable denial body, with the headers that go alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub error: &'static str,
    pub message: String,
    #[serde(skip)]
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Unix seconds at which the oldest counted request leaves the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
    /// Whole seconds, rounded up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Rejection {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let (Some(limit), Some(remaining), Some(reset)) = (self.limit, self.remaining, self.reset_at)
        {
            headers.push(("X-RateLimit-Limit", limit.to_string()));
            headers.push(("X-RateLimit-Remaining", remaining.to_string()));
            headers.push(("X-RateLimit-Reset", reset.to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "error": self.error }))
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Failures of a [`CounterStore`](crate::rate_limit::store::CounterStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store returned an unexpected reply: {0}")]
    Protocol(String),
}

/// Failures of a [`HealthProbe`](crate::health_checker::HealthProbe).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {actual} (expected {expected})")]
    Status { expected: u16, actual: u16 },
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("probe task panicked")]
    Panicked,
}
