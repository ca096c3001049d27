//! Synchronous upstream protection
//!
//! [`UpstreamGuard::protect`] is used by request paths that call the ERP
//! inline instead of through the queue. It refuses work immediately when the
//! local concurrency or per-minute cap is hit, then runs the call under a
//! per-operation timeout with in-process retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::client::ErpOperation;
use crate::config::{env_millis, env_or, ConfigError};
use crate::error::UpstreamError;
use crate::retry::{with_timeout, RetryPolicy};

const RPM_WINDOW: Duration = Duration::from_secs(60);
const CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    pub max_concurrency: usize,
    pub max_rpm: u32,
    pub retry: RetryPolicy,
    pub default_timeout: Duration,
    /// Per-operation overrides keyed by operation name (`getCustomer`, ...)
    pub timeouts: HashMap<String, Duration>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            max_rpm: 120,
            retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(25),
            timeouts: HashMap::new(),
        }
    }
}

impl ProtectionConfig {
    /// Load from `ERP_*` environment variables, including
    /// `ERP_TIMEOUT_<OPERATION>_MS` for each known operation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut timeouts = HashMap::new();
        for op in ErpOperation::ALL {
            let key = format!("ERP_TIMEOUT_{}_MS", op.env_key());
            if std::env::var(&key).is_ok() {
                timeouts.insert(op.as_str().to_string(), env_millis(&key, 0)?);
            }
        }

        Ok(Self {
            max_concurrency: env_or("ERP_MAX_CONCURRENCY", defaults.max_concurrency)?,
            max_rpm: env_or("ERP_MAX_RPM", defaults.max_rpm)?,
            retry: RetryPolicy::from_env()?,
            default_timeout: env_millis("ERP_TIMEOUT_DEFAULT_MS", 25_000)?,
            timeouts,
        })
    }

    pub fn with_timeout(mut self, operation: &str, timeout: Duration) -> Self {
        self.timeouts.insert(operation.to_string(), timeout);
        self
    }

    pub fn timeout_for(&self, operation: &str) -> Duration {
        self.timeouts
            .get(operation)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

#[derive(Debug)]
struct RequestWindow {
    count: u32,
    window_start: Instant,
}

/// Concurrency and per-minute caps around inline ERP calls.
#[derive(Debug)]
pub struct UpstreamGuard {
    config: ProtectionConfig,
    slots: Arc<Semaphore>,
    window: Mutex<RequestWindow>,
}

impl UpstreamGuard {
    pub fn new(config: ProtectionConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            slots,
            window: Mutex::new(RequestWindow {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    async fn admit_rpm(&self) -> Result<(), UpstreamError> {
        let mut window = self.window.lock().await;
        let elapsed = window.window_start.elapsed();
        if elapsed >= RPM_WINDOW {
            window.count = 0;
            window.window_start = Instant::now();
        }

        let elapsed = window.window_start.elapsed();
        if window.count >= self.config.max_rpm {
            return Err(UpstreamError::Throttled {
                scope: "rpm",
                retry_after: RPM_WINDOW.saturating_sub(elapsed).max(Duration::from_secs(1)),
            });
        }
        window.count += 1;
        Ok(())
    }

    /// Run `call` under the caps, the operation's timeout and the retry
    /// policy. The concurrency slot is held across every attempt.
    pub async fn protect<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let _slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| UpstreamError::Throttled {
                scope: "concurrency",
                retry_after: CONCURRENCY_RETRY_AFTER,
            })?;
        self.admit_rpm().await?;

        let timeout = self.config.timeout_for(operation);
        let policy = &self.config.retry;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            match with_timeout(operation, timeout, call()).await {
                Ok(value) => {
                    info!(
                        operation,
                        attempts = attempt,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "erp call succeeded"
                    );
                    return Ok(value);
                }
                Err(err) if policy.should_retry(attempt, &err) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = policy.max_attempts,
                        status = err.status_code(),
                        delay_ms = delay.as_millis() as u64,
                        attempt_ms = attempt_started.elapsed().as_millis() as u64,
                        error = %err,
                        "erp call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        operation,
                        attempts = attempt,
                        status = err.status_code(),
                        transient = err.is_transient(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "erp call failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard(max_concurrency: usize, max_rpm: u32) -> UpstreamGuard {
        UpstreamGuard::new(ProtectionConfig {
            max_concurrency,
            max_rpm,
            retry: RetryPolicy::default().without_jitter(),
            ..ProtectionConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let guard = guard(5, 120);
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = guard
            .protect("getCustomer", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(UpstreamError::Status {
                        status: 503,
                        body: "busy".into(),
                    }),
                    _ => Ok("C001"),
                }
            })
            .await;

        assert_eq!(result.unwrap(), "C001");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 300ms + 600ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(guard.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let guard = guard(5, 120);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = guard
            .protect("getCustomer", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Status {
                    status: 404,
                    body: String::new(),
                })
            })
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient_attempt() {
        let guard = UpstreamGuard::new(
            ProtectionConfig {
                retry: RetryPolicy::default().without_jitter(),
                ..ProtectionConfig::default()
            }
            .with_timeout("getOpportunity", Duration::from_millis(100)),
        );
        let calls = AtomicU32::new(0);

        let result = guard
            .protect("getOpportunity", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_cap_rejects_with_window_remainder() {
        let guard = guard(5, 2);
        for _ in 0..2 {
            guard.protect("getCustomer", || async { Ok(()) }).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        let err = guard
            .protect("getCustomer", || async { Ok(()) })
            .await
            .unwrap_err();
        let retry_after = err.retry_after().unwrap();
        assert!(retry_after <= Duration::from_secs(40));
        assert!(retry_after >= Duration::from_secs(39));

        tokio::time::advance(Duration::from_secs(41)).await;
        assert!(guard.protect("getCustomer", || async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_cap_fails_fast() {
        let guard = Arc::new(guard(1, 120));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .protect("createOpportunity", || async { Ok(()) })
                    .await
                    .ok();
            })
        };
        holder.await.unwrap();

        // Hold the only slot open while a second caller arrives
        let blocker = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let mut rx = Some(rx);
                guard
                    .protect("createOpportunity", || {
                        let rx = rx.take();
                        async move {
                            if let Some(rx) = rx {
                                rx.await.ok();
                            }
                            Ok(())
                        }
                    })
                    .await
            })
        };
        while guard.available() > 0 {
            tokio::task::yield_now().await;
        }

        let err = guard
            .protect("createOpportunity", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Throttled {
                scope: "concurrency",
                ..
            }
        ));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert_eq!(guard.available(), 1);
    }
}
