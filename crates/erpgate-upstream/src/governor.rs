//! Dual-scope rate governor
//!
//! Every upstream call made by a worker holds a slot in two semaphores and
//! spends a token from two buckets: one pair shared by the whole process and
//! one pair per scope (the upstream caller class, e.g. a vendor). Acquisition
//! order is global slot, scoped slot, global token, scoped token; slots are
//! released scoped first, then global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bucket::{BucketError, TokenBucket};
use crate::config::{env_or, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub max_concurrency: usize,
    pub max_rpm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    pub global: GovernorLimits,
    /// Applied to each scope independently
    pub scoped: GovernorLimits,
    /// Waits longer than this are logged as warnings
    pub slow_wait_threshold: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            global: GovernorLimits {
                max_concurrency: 12,
                max_rpm: 200,
            },
            scoped: GovernorLimits {
                max_concurrency: 8,
                max_rpm: 90,
            },
            slow_wait_threshold: Duration::from_millis(250),
        }
    }
}

impl GovernorConfig {
    /// Load from `GLOBAL_MAX_*` / `VENDOR_MAX_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            global: GovernorLimits {
                max_concurrency: env_or("GLOBAL_MAX_CONCURRENCY", defaults.global.max_concurrency)?,
                max_rpm: env_or("GLOBAL_MAX_RPM", defaults.global.max_rpm)?,
            },
            scoped: GovernorLimits {
                max_concurrency: env_or("VENDOR_MAX_CONCURRENCY", defaults.scoped.max_concurrency)?,
                max_rpm: env_or("VENDOR_MAX_RPM", defaults.scoped.max_rpm)?,
            },
            slow_wait_threshold: defaults.slow_wait_threshold,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("Governor semaphore closed")]
    Closed,
    #[error(transparent)]
    Bucket(#[from] BucketError),
}

/// Time spent at each stage of acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleWaits {
    pub global_slot: Duration,
    pub scoped_slot: Duration,
    pub global_tokens: Duration,
    pub scoped_tokens: Duration,
}

impl ThrottleWaits {
    pub fn longest(&self) -> Duration {
        self.global_slot
            .max(self.scoped_slot)
            .max(self.global_tokens)
            .max(self.scoped_tokens)
    }
}

/// Held for the duration of one upstream call.
#[derive(Debug)]
pub struct GovernorPermit {
    // Fields drop in declaration order: scoped slot first, then global.
    _scoped: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    pub waits: ThrottleWaits,
}

#[derive(Debug)]
struct ScopeLimiter {
    slots: Arc<Semaphore>,
    tokens: TokenBucket,
}

impl ScopeLimiter {
    fn new(limits: GovernorLimits) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
            tokens: TokenBucket::per_minute(limits.max_rpm.max(1)),
        }
    }
}

async fn acquire_slot(slots: &Arc<Semaphore>) -> Result<(OwnedSemaphorePermit, Duration), GovernorError> {
    let started = Instant::now();
    let permit = slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| GovernorError::Closed)?;
    Ok((permit, started.elapsed()))
}

/// Shared, injected limiter state for all upstream calls in a process.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    global: ScopeLimiter,
    scopes: RwLock<HashMap<String, Arc<ScopeLimiter>>>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            global: ScopeLimiter::new(config.global),
            scopes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Wait for a global and a scoped slot plus one token from each bucket.
    pub async fn acquire(&self, scope: &str) -> Result<GovernorPermit, GovernorError> {
        let scoped = self.get_or_create_scope(scope).await;

        let (global_permit, global_slot) = acquire_slot(&self.global.slots).await?;
        let (scoped_permit, scoped_slot) = acquire_slot(&scoped.slots).await?;
        let global_tokens = self.global.tokens.take(1).await?;
        let scoped_tokens = scoped.tokens.take(1).await?;

        let waits = ThrottleWaits {
            global_slot,
            scoped_slot,
            global_tokens,
            scoped_tokens,
        };

        if waits.longest() > self.config.slow_wait_threshold {
            warn!(
                scope,
                global_slot_wait_ms = global_slot.as_millis() as u64,
                scoped_slot_wait_ms = scoped_slot.as_millis() as u64,
                global_token_wait_ms = global_tokens.as_millis() as u64,
                scoped_token_wait_ms = scoped_tokens.as_millis() as u64,
                global_max_concurrency = self.config.global.max_concurrency,
                global_max_rpm = self.config.global.max_rpm,
                scoped_max_concurrency = self.config.scoped.max_concurrency,
                scoped_max_rpm = self.config.scoped.max_rpm,
                "throttle wait observed"
            );
        }

        Ok(GovernorPermit {
            _scoped: scoped_permit,
            _global: global_permit,
            waits,
        })
    }

    /// Slots currently free in the global semaphore
    pub fn global_available(&self) -> usize {
        self.global.slots.available_permits()
    }

    async fn get_or_create_scope(&self, scope: &str) -> Arc<ScopeLimiter> {
        // Fast path: check if exists
        {
            let scopes = self.scopes.read().await;
            if let Some(limiter) = scopes.get(scope) {
                return limiter.clone();
            }
        }

        let mut scopes = self.scopes.write().await;
        // Double-check after acquiring write lock
        if let Some(limiter) = scopes.get(scope) {
            return limiter.clone();
        }

        debug!(scope, "creating scoped limiter");
        let limiter = Arc::new(ScopeLimiter::new(self.config.scoped));
        scopes.insert(scope.to_string(), limiter.clone());
        limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(global: usize, scoped: usize, rpm: u32) -> GovernorConfig {
        GovernorConfig {
            global: GovernorLimits {
                max_concurrency: global,
                max_rpm: rpm,
            },
            scoped: GovernorLimits {
                max_concurrency: scoped,
                max_rpm: rpm,
            },
            slow_wait_threshold: Duration::from_millis(250),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_concurrency_cap_is_respected() {
        let governor = Arc::new(RateGovernor::new(config(10, 2, 10_000)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let governor = governor.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = governor.acquire("specbooks").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(governor.global_available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_cap_spans_scopes() {
        let governor = Arc::new(RateGovernor::new(config(3, 3, 10_000)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for n in 0..9 {
            let governor = governor.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let scope = format!("vendor-{}", n % 3);
                let _permit = governor.acquire(&scope).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_token_wait_is_reported() {
        // 600 per minute: once the burst is spent the next call waits ~100ms
        let governor = RateGovernor::new(config(5, 5, 600));
        for _ in 0..600 {
            let permit = governor.acquire("specbooks").await.unwrap();
            assert!(permit.waits.longest() < Duration::from_millis(25));
        }

        let permit = governor.acquire("specbooks").await.unwrap();
        assert!(permit.waits.global_tokens >= Duration::from_millis(75));
        assert!(permit.waits.longest() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_permit_drop_releases_both_slots() {
        let governor = RateGovernor::new(config(1, 1, 1000));
        let permit = governor.acquire("a").await.unwrap();
        assert_eq!(governor.global_available(), 0);
        drop(permit);
        assert_eq!(governor.global_available(), 1);
        // Both slots are free again, so a second acquisition does not block
        let _again = governor.acquire("a").await.unwrap();
    }
}
