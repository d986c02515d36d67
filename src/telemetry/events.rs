use crate::registry::BackendKey;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the gateway while it admits, routes and reports.
///
/// They describe behaviour that never reaches the caller directly (fail-open
/// admissions, degraded routing, breaker transitions) so it can be counted,
/// logged or forwarded to external systems.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Rate limiter decisions
    Admission(AdmissionEvent),
    /// Circuit breaker transitions
    CircuitBreaker(CircuitBreakerEvent),
    /// Load balancer events
    Selection(SelectionEvent),
    /// Health checker observations
    Health(HealthEvent),
    /// Forwarded request outcomes
    Request(RequestOutcome),
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The request fit in its quota (or matched no rule).
    Admitted {
        rule_id: Option<String>,
        remaining: u64,
    },
    /// The request exceeded its quota.
    Denied {
        rule_id: String,
        retry_after: Duration,
    },
    /// The counter store failed or timed out; the request was admitted anyway.
    FailOpen {
        rule_id: String,
        reason: String,
    },
}

/// Events emitted when a backend's breaker changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Subsequent requests to the backend are rejected without a call.
    Opened {
        backend: BackendKey,
        /// Consecutive failures that triggered the open
        failure_count: usize,
    },
    /// The cooldown elapsed and a trial request was admitted.
    HalfOpen { backend: BackendKey },
    /// The trial succeeded; normal routing resumes.
    Closed { backend: BackendKey },
}

/// Events emitted by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionEvent {
    /// No backend passed the health filter; the first registered one was used.
    Degraded { backend: BackendKey },
}

/// Events emitted by the health checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Probed {
        backend: BackendKey,
        healthy: bool,
        latency: Duration,
    },
}

/// Outcome of a forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { backend: BackendKey, duration: Duration },
    Failure { backend: BackendKey, duration: Duration },
    /// The caller went away before the backend answered.
    Cancelled { backend: BackendKey, duration: Duration },
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::Admission(event) => write!(f, "Admission::{}", event),
            GatewayEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            GatewayEvent::Selection(event) => write!(f, "Selection::{}", event),
            GatewayEvent::Health(event) => write!(f, "Health::{}", event),
            GatewayEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { rule_id, remaining } => match rule_id {
                Some(id) => write!(f, "Admitted(rule={}, remaining={})", id, remaining),
                None => write!(f, "Admitted(unlimited)"),
            },
            AdmissionEvent::Denied { rule_id, retry_after } => {
                write!(f, "Denied(rule={}, retry_after={:?})", rule_id, retry_after)
            }
            AdmissionEvent::FailOpen { rule_id, reason } => {
                write!(f, "FailOpen(rule={}, reason={})", rule_id, reason)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { backend, failure_count } => {
                write!(f, "Opened({}, failures={})", backend, failure_count)
            }
            CircuitBreakerEvent::HalfOpen { backend } => write!(f, "HalfOpen({})", backend),
            CircuitBreakerEvent::Closed { backend } => write!(f, "Closed({})", backend),
        }
    }
}

impl fmt::Display for SelectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionEvent::Degraded { backend } => write!(f, "Degraded({})", backend),
        }
    }
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthEvent::Probed { backend, healthy, latency } => {
                write!(f, "Probed({}, healthy={}, latency={:?})", backend, healthy, latency)
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { backend, duration } => {
                write!(f, "Success({}, duration={:?})", backend, duration)
            }
            RequestOutcome::Failure { backend, duration } => {
                write!(f, "Failure({}, duration={:?})", backend, duration)
            }
            RequestOutcome::Cancelled { backend, duration } => {
                write!(f, "Cancelled({}, duration={:?})", backend, duration)
            }
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a GatewayEvent into a JSON value for sinks.
pub fn event_to_json(event: &GatewayEvent) -> serde_json::Value {
    match event {
        GatewayEvent::Admission(a) => match a {
            AdmissionEvent::Admitted { rule_id, remaining } => json!({
                "kind": "admitted",
                "rule": rule_id,
                "remaining": *remaining,
            }),
            AdmissionEvent::Denied { rule_id, retry_after } => json!({
                "kind": "denied",
                "rule": rule_id,
                "retry_after_ms": clamp_u64(retry_after.as_millis()),
            }),
            AdmissionEvent::FailOpen { rule_id, reason } => json!({
                "kind": "fail_open",
                "rule": rule_id,
                "reason": reason,
            }),
        },
        GatewayEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { backend, failure_count } => json!({
                "kind": "circuit_opened",
                "service": backend.service,
                "backend": backend.address,
                "failures": *failure_count,
            }),
            CircuitBreakerEvent::HalfOpen { backend } => json!({
                "kind": "circuit_half_open",
                "service": backend.service,
                "backend": backend.address,
            }),
            CircuitBreakerEvent::Closed { backend } => json!({
                "kind": "circuit_closed",
                "service": backend.service,
                "backend": backend.address,
            }),
        },
        GatewayEvent::Selection(SelectionEvent::Degraded { backend }) => json!({
            "kind": "selection_degraded",
            "service": backend.service,
            "backend": backend.address,
        }),
        GatewayEvent::Health(HealthEvent::Probed { backend, healthy, latency }) => json!({
            "kind": "health_probed",
            "service": backend.service,
            "backend": backend.address,
            "healthy": *healthy,
            "latency_ms": clamp_u64(latency.as_millis()),
        }),
        GatewayEvent::Request(r) => {
            let (kind, backend, duration) = match r {
                RequestOutcome::Success { backend, duration } => ("request_success", backend, duration),
                RequestOutcome::Failure { backend, duration } => ("request_failure", backend, duration),
                RequestOutcome::Cancelled { backend, duration } => {
                    ("request_cancelled", backend, duration)
                }
            };
            json!({
                "kind": kind,
                "service": backend.service,
                "backend": backend.address,
                "duration_ms": clamp_u64(duration.as_millis()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BackendKey {
        BackendKey::new("ml", "http://ml-1:8000")
    }

    #[test]
    fn display_nests_the_variant() {
        let event = GatewayEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            backend: key(),
            failure_count: 5,
        });
        assert_eq!(event.to_string(), "CircuitBreaker::Opened(ml@http://ml-1:8000, failures=5)");

        let unlimited =
            GatewayEvent::Admission(AdmissionEvent::Admitted { rule_id: None, remaining: 0 });
        assert_eq!(unlimited.to_string(), "Admission::Admitted(unlimited)");
    }

    #[test]
    fn denied_json() {
        let v = event_to_json(&GatewayEvent::Admission(AdmissionEvent::Denied {
            rule_id: "ml".into(),
            retry_after: Duration::from_millis(1500),
        }));
        assert_eq!(v["kind"], "denied");
        assert_eq!(v["rule"], "ml");
        assert_eq!(v["retry_after_ms"], 1500);
    }

    #[test]
    fn cancelled_request_json() {
        let v = event_to_json(&GatewayEvent::Request(RequestOutcome::Cancelled {
            backend: key(),
            duration: Duration::from_millis(20),
        }));
        assert_eq!(v["kind"], "request_cancelled");
        assert_eq!(v["service"], "ml");
        assert_eq!(v["duration_ms"], 20);
    }

    #[test]
    fn probe_json_carries_health() {
        let v = event_to_json(&GatewayEvent::Health(HealthEvent::Probed {
            backend: key(),
            healthy: false,
            latency: Duration::from_millis(7),
        }));
        assert_eq!(v["healthy"], false);
        assert_eq!(v["latency_ms"], 7);
    }
}
