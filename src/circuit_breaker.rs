//! Per-backend circuit breaker built on lock-free atomics.
//!
//! ```text
//!   Closed --(failures >= threshold)--> Open --(cooldown elapsed, on access)--> HalfOpen
//!     ^                                  ^                                         |
//!     |                                  +------------(trial failed)---------------+
//!     +-----------------------------------(trial succeeded)------------------------+
//! ```
//!
//! The Open -> HalfOpen check is lazy: it happens when someone asks
//! [`CircuitBreaker::try_acquire`], never on a timer. While half-open exactly one
//! trial request holds the probe slot; everyone else is rejected as if open.

use crate::clock::{duration_to_millis, Clock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// One trial call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> CircuitState {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Validated configuration shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBreakerConfig", into = "RawBreakerConfig")]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    cooldown: Duration,
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
struct RawBreakerConfig {
    failure_threshold: usize,
    cooldown_secs: u64,
}

impl Default for RawBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cooldown_secs: DEFAULT_COOLDOWN.as_secs() }
    }
}

impl TryFrom<RawBreakerConfig> for CircuitBreakerConfig {
    type Error = CircuitBreakerError;

    fn try_from(raw: RawBreakerConfig) -> Result<Self, Self::Error> {
        CircuitBreakerConfig::new(raw.failure_threshold, Duration::from_secs(raw.cooldown_secs))
    }
}

impl From<CircuitBreakerConfig> for RawBreakerConfig {
    fn from(cfg: CircuitBreakerConfig) -> Self {
        Self { failure_threshold: cfg.failure_threshold, cooldown_secs: cfg.cooldown.as_secs() }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Cooldown must be > 0.
    InvalidCooldown(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidCooldown(cooldown) => {
                write!(f, "cooldown must be > 0 (got {:?})", cooldown)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        Ok(Self { failure_threshold, cooldown })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Time since the last failure before an Open breaker admits a trial.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cooldown: DEFAULT_COOLDOWN }
    }
}

/// A state change produced by the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Consecutive failures at the time of the change.
    pub failures: usize,
}

/// Successful [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// This call holds the half-open trial slot and must be reported.
    pub trial: bool,
    pub transition: Option<Transition>,
}

/// Rejected [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub failure_count: usize,
    /// Time since the last recorded failure.
    pub open_for: Duration,
}

/// Circuit breaker guarding a single backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_millis: AtomicU64,
    trial_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Effective state. An Open breaker whose cooldown has elapsed reports
    /// `HalfOpen`, since the next access will admit a trial.
    pub fn state(&self) -> CircuitState {
        match self.stored_state() {
            CircuitState::Open if self.cooldown_elapsed() => CircuitState::HalfOpen,
            other => other,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent failure, if any was recorded.
    pub fn last_failure_millis(&self) -> Option<u64> {
        match self.last_failure_millis.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Whether [`try_acquire`](Self::try_acquire) would admit a request right
    /// now. Claims nothing, so a racing caller may still take the trial slot.
    pub fn would_admit(&self) -> bool {
        match self.stored_state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                self.cooldown_elapsed() && !self.trial_in_flight.load(Ordering::Acquire)
            }
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Boolean form of [`try_acquire`](Self::try_acquire).
    pub fn allow_request(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Ask to send one request through the breaker.
    ///
    /// Closed always admits. Open rejects until the cooldown elapses, then moves to
    /// HalfOpen. HalfOpen admits only the caller that wins the trial slot.
    pub fn try_acquire(&self) -> Result<Acquired, Rejected> {
        let mut transition = None;
        loop {
            match self.stored_state() {
                CircuitState::Closed => return Ok(Acquired { trial: false, transition }),
                CircuitState::Open => {
                    if !self.cooldown_elapsed() {
                        return Err(self.rejection());
                    }
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::info!(target: "tollgate::circuit_breaker", "circuit breaker → half-open");
                        transition = Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            failures: self.failure_count(),
                        });
                    }
                    // Re-read: we or a racing caller moved it on.
                    continue;
                }
                CircuitState::HalfOpen => {
                    if self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(self.rejection());
                    }
                    if self.stored_state() == CircuitState::HalfOpen {
                        tracing::debug!(target: "tollgate::circuit_breaker", "half-open trial admitted");
                        return Ok(Acquired { trial: true, transition });
                    }
                    // The trial resolved between our reads; release the slot and retry.
                    self.trial_in_flight.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Feed one observed outcome into the transition function.
    pub fn record(&self, success: bool) -> Option<Transition> {
        if success {
            self.on_success()
        } else {
            self.on_failure()
        }
    }

    /// Force the breaker back to Closed, clearing failure counts.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_millis.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Any success resets the consecutive failure count; only an unbroken streak of
    /// `failure_threshold` failures trips the breaker.
    fn on_success(&self) -> Option<Transition> {
        self.failure_count.store(0, Ordering::Release);
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.trial_in_flight.store(false, Ordering::Release);
            tracing::info!(target: "tollgate::circuit_breaker", "circuit breaker → closed");
            return Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed,
                failures: 0,
            });
        }
        None
    }

    fn on_failure(&self) -> Option<Transition> {
        // Stamp first so anyone observing Open sees a valid cooldown origin.
        self.last_failure_millis.store(self.clock.now_millis().max(1), Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match self.stored_state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.trial_in_flight.store(false, Ordering::Release);
                    tracing::warn!(target: "tollgate::circuit_breaker", failures, "circuit breaker: trial failed → open");
                    return Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        failures,
                    });
                }
                None
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::error!(
                        target: "tollgate::circuit_breaker",
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                    return Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        failures,
                    });
                }
                None
            }
            // Already open: the stamp above restarts the cooldown.
            CircuitState::Open => None,
        }
    }

    fn stored_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn since_last_failure(&self) -> Duration {
        let last = self.last_failure_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(last))
    }

    fn cooldown_elapsed(&self) -> bool {
        duration_to_millis(self.since_last_failure()) >= duration_to_millis(self.config.cooldown)
    }

    fn rejection(&self) -> Rejected {
        Rejected { failure_count: self.failure_count(), open_for: self.since_last_failure() }
    }
}
