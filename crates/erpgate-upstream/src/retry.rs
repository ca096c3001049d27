//! Retry policy and per-call timeouts

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::{env_millis, env_or, ConfigError};
use crate::error::UpstreamError;

/// Exponential backoff with additive jitter.
///
/// `delay(n) = min(max_delay, base_delay * 2^(n-1) + jitter)`, jitter uniform
/// in `[0, max_jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(2500),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Load from `ERP_RETRY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_or("ERP_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            base_delay: env_millis("ERP_RETRY_BASE_MS", 300)?,
            max_delay: env_millis("ERP_RETRY_MAX_MS", 2500)?,
            max_jitter: defaults.max_jitter,
        })
    }

    /// Same policy without randomness (tests, deterministic schedules)
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Delay before retrying after the `attempt`-th failure (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };

        (backoff + jitter).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32, error: &UpstreamError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }
}

/// Run `fut` under a deadline; expiry cancels it and yields a transient
/// `Timeout` error.
pub async fn with_timeout<T, Fut>(
    operation: &str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, UpstreamError>
where
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout {
            operation: operation.to_string(),
            after: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule_without_jitter() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(2400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(2500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(2500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_jitter, Duration::from_millis(200));
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(300));
            assert!(delay < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_should_retry_requires_transient_and_budget() {
        let policy = RetryPolicy::default();
        let unavailable = UpstreamError::Status {
            status: 503,
            body: String::new(),
        };
        let bad_request = UpstreamError::Status {
            status: 400,
            body: String::new(),
        };
        assert!(policy.should_retry(1, &unavailable));
        assert!(policy.should_retry(2, &unavailable));
        assert!(!policy.should_retry(3, &unavailable));
        assert!(!policy.should_retry(1, &bad_request));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_slow_call() {
        let result: Result<(), _> = with_timeout("getCustomer", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.status_code(), Some(504));
    }
}
