//! Sliding-window rate limiting.
//!
//! - [`RuleSet`]: validated rules and best-match selection.
//! - [`RateLimiter`]: evaluates a caller against the matching rule.
//! - [`CounterStore`](store::CounterStore): where window logs live. The
//!   process-local [`InMemoryCounterStore`](store::InMemoryCounterStore) is used
//!   unless a shared store is supplied.
//! - [`AdmissionLayer`]: Tower middleware that puts the limiter in front of any
//!   service.
//!
//! The limiter fails open: when the store errors or is slower than the store
//! timeout, requests are admitted and the failure is logged, counted and emitted
//! as telemetry.

use crate::config::{RateLimitRule, ScopeKind};
use crate::error::{ceil_secs, GatewayError};
use crate::identity::{Identity, ANONYMOUS_API_KEY};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub mod limiter;
pub mod middleware;
pub mod rules;
pub mod store;

pub use limiter::{LimiterStats, RateLimiter};
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionService};
pub use rules::RuleSet;
pub use store::{CounterStore, InMemoryCounterStore, WindowAdmission};

/// Quota state of one counter after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// When the oldest counted request leaves the window (Unix millis).
    pub reset_at_millis: u64,
}

impl Quota {
    pub fn reset_at_secs(&self) -> u64 {
        ceil_secs(Duration::from_millis(self.reset_at_millis))
    }

    /// `X-RateLimit-*` headers for an admitted response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_secs().to_string()),
        ]
    }
}

/// The decision returned by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// `None` when no rule matched (unlimited).
        rule_id: Option<String>,
        /// `None` when unlimited or when the store could not be consulted.
        quota: Option<Quota>,
        /// Admitted because the counter store failed.
        fail_open: bool,
    },
    /// The request exceeds its quota and must not be forwarded.
    Denied { rule_id: String, quota: Quota, retry_after: Duration },
}

impl Decision {
    pub(crate) fn unlimited() -> Self {
        Decision::Allowed { rule_id: None, quota: None, fail_open: false }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn is_fail_open(&self) -> bool {
        matches!(self, Decision::Allowed { fail_open: true, .. })
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Decision::Allowed { rule_id, .. } => rule_id.as_deref(),
            Decision::Denied { rule_id, .. } => Some(rule_id),
        }
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Decision::Allowed { quota, .. } => quota.as_ref(),
            Decision::Denied { quota, .. } => Some(quota),
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.quota().map(|q| q.remaining)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after, .. } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }

    /// The caller-visible error for a denial.
    pub fn into_error(self) -> Option<GatewayError> {
        match self {
            Decision::Denied { rule_id, quota, retry_after } => {
                Some(GatewayError::QuotaExceeded { rule_id, quota, retry_after })
            }
            Decision::Allowed { .. } => None,
        }
    }
}

/// Identifies one sliding window: scope, scope identity and rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    scope: ScopeKind,
    identity: Option<String>,
    rule_id: String,
}

impl CounterKey {
    /// `per_user` without a user id collapses to the rule's global bucket;
    /// `per_api_key` without a key counts as `anonymous`.
    pub fn for_rule(rule: &RateLimitRule, identity: &Identity) -> Self {
        let (scope, value) = match rule.scope() {
            ScopeKind::PerIp => (
                ScopeKind::PerIp,
                Some(identity.ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())),
            ),
            ScopeKind::PerUser => match &identity.user_id {
                Some(user) => (ScopeKind::PerUser, Some(user.clone())),
                None => (ScopeKind::Global, None),
            },
            ScopeKind::PerApiKey => (
                ScopeKind::PerApiKey,
                Some(identity.api_key.clone().unwrap_or_else(|| ANONYMOUS_API_KEY.to_string())),
            ),
            ScopeKind::Global => (ScopeKind::Global, None),
        };
        Self { scope, identity: value, rule_id: rule.id().to_string() }
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(value) => {
                write!(f, "rate_limit:{}:{}:{}", self.scope.key_label(), value, self.rule_id)
            }
            None => write!(f, "rate_limit:{}:{}", self.scope.key_label(), self.rule_id),
        }
    }
}
