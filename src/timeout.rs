//! Bounded waits for store calls, backend forwards and health probes.

use crate::config::{
    ConfigError, DEFAULT_FORWARD_TIMEOUT, DEFAULT_PROBE_TIMEOUT, DEFAULT_STORE_TIMEOUT,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {elapsed:?} (limit: {limit:?})")]
pub struct TimedOut {
    pub elapsed: Duration,
    pub limit: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    pub const DEFAULT_STORE: TimeoutPolicy = TimeoutPolicy { duration: DEFAULT_STORE_TIMEOUT };
    pub const DEFAULT_FORWARD: TimeoutPolicy = TimeoutPolicy { duration: DEFAULT_FORWARD_TIMEOUT };
    pub const DEFAULT_PROBE: TimeoutPolicy = TimeoutPolicy { duration: DEFAULT_PROBE_TIMEOUT };

    /// `name` identifies the timeout in the error for a zero duration.
    pub fn new(name: &'static str, duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::ZeroTimeout { name });
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drives `fut` until it completes or the limit passes; on expiry the future is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, TimedOut>
    where
        F: Future,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, fut).await {
            Ok(output) => Ok(output),
            Err(_) => Err(TimedOut { elapsed: start.elapsed(), limit: self.duration }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn zero_is_rejected() {
        let err = TimeoutPolicy::new("store_timeout", Duration::ZERO).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout { name: "store_timeout" }));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new("t", Duration::from_millis(100)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = timeout
            .run(async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation() {
        let limit = Duration::from_millis(50);
        let timeout = TimeoutPolicy::new("t", limit).unwrap();

        let err = timeout.run(tokio::time::sleep(Duration::from_secs(5))).await.unwrap_err();

        assert_eq!(err.limit, limit);
        assert!(err.elapsed >= limit, "elapsed time should be at least the limit");
    }

    #[tokio::test(start_paused = true)]
    async fn inner_errors_pass_through() {
        let timeout = TimeoutPolicy::new("t", Duration::from_secs(1)).unwrap();
        let result = timeout.run(async { Err::<(), _>("operation failed") }).await;
        assert_eq!(result.unwrap(), Err("operation failed"));
    }
}
