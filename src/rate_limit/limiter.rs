use super::rules::RuleSet;
use super::store::{CounterStore, InMemoryCounterStore};
use super::{CounterKey, Decision, Quota};
use crate::clock::{duration_to_millis, Clock, SystemClock};
use crate::config::{ConfigError, RateLimitRule, DEFAULT_STORE_TIMEOUT};
use crate::error::StoreError;
use crate::identity::Identity;
use crate::telemetry::{AdmissionEvent, GatewayEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Counter totals since the limiter was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub evaluated: u64,
    pub denied: u64,
    /// Admissions granted because the counter store failed or timed out.
    pub store_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    evaluated: AtomicU64,
    denied: AtomicU64,
    store_failures: AtomicU64,
}

/// Sliding-window log limiter over a [`CounterStore`].
pub struct RateLimiter {
    rules: RuleSet,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: TimeoutPolicy,
    telemetry: Telemetry,
    nonce: u64,
    sequence: AtomicU64,
    counters: Counters,
}

impl RateLimiter {
    /// In-memory limiter with default settings.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            store: Arc::new(InMemoryCounterStore::new()),
            clock: Arc::new(SystemClock),
            store_timeout: TimeoutPolicy::DEFAULT_STORE,
            telemetry: Telemetry::noop(),
            nonce: rand::random(),
            sequence: AtomicU64::new(0),
            counters: Counters::default(),
            rules,
        }
    }

    pub fn builder(rules: RuleSet) -> RateLimiterBuilder {
        RateLimiterBuilder {
            rules,
            store: None,
            clock: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            telemetry: Telemetry::noop(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            store_failures: self.counters.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Evaluate one request. Never fails: store problems become fail-open admissions.
    pub async fn evaluate(&self, identity: &Identity, path: &str) -> Decision {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
        let Some(rule) = self.rules.select(identity.tier, path) else {
            debug!(target: "tollgate::rate_limit", tier = %identity.tier, path, "no rule matched; unlimited");
            return Decision::unlimited();
        };

        let key = CounterKey::for_rule(rule, identity).to_string();
        let now = self.clock.now_millis();
        let window = rule.window();
        let window_ms = duration_to_millis(window);
        let member = self.next_member(now);
        let store = &self.store;

        let attempt = async {
            store.remove_older_than(&key, now.saturating_sub(window_ms)).await?;
            let admission =
                store.add_if_under_limit(&key, &member, now, rule.limit(), window).await?;
            Ok::<_, StoreError>(admission)
        };
        let admission = match self.store_timeout.run(attempt).await {
            Ok(Ok(admission)) => admission,
            Ok(Err(err)) => return self.fail_open(rule, err).await,
            Err(timed_out) => {
                return self.fail_open(rule, StoreError::Timeout(timed_out.limit)).await
            }
        };

        let reset_at_millis = admission.oldest_millis.unwrap_or(now).saturating_add(window_ms);
        if admission.admitted {
            let remaining = rule.limit().saturating_sub(admission.count);
            let quota = Quota { limit: rule.limit(), remaining, reset_at_millis };
            debug!(target: "tollgate::rate_limit", rule = rule.id(), key = %key, remaining, "admitted");
            self.telemetry
                .emit(GatewayEvent::Admission(AdmissionEvent::Admitted {
                    rule_id: Some(rule.id().to_string()),
                    remaining,
                }))
                .await;
            Decision::Allowed { rule_id: Some(rule.id().to_string()), quota: Some(quota), fail_open: false }
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            let wait_ms = reset_at_millis.saturating_sub(now).clamp(1, window_ms.max(1));
            let retry_after = Duration::from_millis(wait_ms);
            let quota = Quota { limit: rule.limit(), remaining: 0, reset_at_millis };
            debug!(target: "tollgate::rate_limit", rule = rule.id(), key = %key, ?retry_after, "denied");
            self.telemetry
                .emit(GatewayEvent::Admission(AdmissionEvent::Denied {
                    rule_id: rule.id().to_string(),
                    retry_after,
                }))
                .await;
            Decision::Denied { rule_id: rule.id().to_string(), quota, retry_after }
        }
    }

    async fn fail_open(&self, rule: &RateLimitRule, err: StoreError) -> Decision {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "tollgate::rate_limit",
            rule = rule.id(),
            store = self.store.name(),
            error = %err,
            "counter store failed; admitting request"
        );
        self.telemetry
            .emit(GatewayEvent::Admission(AdmissionEvent::FailOpen {
                rule_id: rule.id().to_string(),
                reason: err.to_string(),
            }))
            .await;
        Decision::Allowed { rule_id: Some(rule.id().to_string()), quota: None, fail_open: true }
    }

    /// Unique per attempt even within one millisecond, and across processes.
    fn next_member(&self, now: u64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{:x}:{}", now, self.nonce, seq)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.total_count())
            .field("store", &self.store.name())
            .field("store_timeout", &self.store_timeout.duration())
            .finish()
    }
}

/// Builder for [`RateLimiter`]. Without a store, an [`InMemoryCounterStore`]
/// sharing the limiter's clock is used.
pub struct RateLimiterBuilder {
    rules: RuleSet,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    store_timeout: Duration,
    telemetry: Telemetry,
}

impl RateLimiterBuilder {
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        let store_timeout = TimeoutPolicy::new("store_timeout", self.store_timeout)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryCounterStore::with_clock(clock.clone())),
        };
        debug!(target: "tollgate::rate_limit", store = store.name(), rules = self.rules.total_count(), "rate limiter built");
        Ok(RateLimiter {
            rules: self.rules,
            store,
            clock,
            store_timeout,
            telemetry: self.telemetry,
            nonce: rand::random(),
            sequence: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }
}
