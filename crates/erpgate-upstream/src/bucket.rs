//! Per-minute token bucket over a GCRA limiter (governor)

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest sleep between readiness checks
const MIN_WAIT: Duration = Duration::from_millis(25);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("requested {requested} tokens from a bucket of capacity {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

/// Bucket holding up to `capacity` tokens, replenished continuously at
/// `capacity` per minute. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: NonZeroU32,
    limiter: DirectLimiter,
    clock: DefaultClock,
}

impl TokenBucket {
    /// A capacity of zero is treated as one.
    pub fn per_minute(capacity: u32) -> Self {
        let capacity = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(capacity).allow_burst(capacity);
        Self {
            capacity,
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    /// Take `n` tokens, sleeping until the limiter can grant all of them at
    /// once. Returns how long the caller waited.
    pub async fn take(&self, n: u32) -> Result<Duration, BucketError> {
        let Some(cells) = NonZeroU32::new(n) else {
            return Ok(Duration::ZERO);
        };

        let started = Instant::now();
        loop {
            match self.limiter.check_n(cells) {
                Ok(Ok(())) => return Ok(started.elapsed()),
                Ok(Err(not_until)) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    tokio::time::sleep(wait.max(MIN_WAIT)).await;
                }
                Err(_) => {
                    return Err(BucketError::ExceedsCapacity {
                        requested: n,
                        capacity: self.capacity.get(),
                    })
                }
            }
        }
    }

    /// Take `n` tokens only if they are available right now.
    pub fn try_take(&self, n: u32) -> bool {
        match NonZeroU32::new(n) {
            Some(cells) => matches!(self.limiter.check_n(cells), Ok(Ok(()))),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_full_bucket_grants_immediately() {
        let bucket = TokenBucket::per_minute(3);
        for _ in 0..3 {
            assert!(bucket.take(1).await.unwrap() < MIN_WAIT);
        }
        assert!(!bucket.try_take(1));
    }

    #[tokio::test]
    async fn test_empty_bucket_waits_for_refill() {
        // 600 per minute = one token every 100ms
        let bucket = TokenBucket::per_minute(600);
        for _ in 0..600 {
            assert!(bucket.try_take(1));
        }

        let waited = bucket.take(1).await.unwrap();
        assert!(waited >= Duration::from_millis(75), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_no_overgrant_under_contention() {
        let bucket = Arc::new(TokenBucket::per_minute(600));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..605 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.take(1).await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Five tokens beyond the burst need about 500ms of refill
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(!bucket.try_take(1));
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let bucket = TokenBucket::per_minute(5);
        assert!(matches!(
            bucket.take(6).await,
            Err(BucketError::ExceedsCapacity {
                requested: 6,
                capacity: 5
            })
        ));
        assert_eq!(bucket.take(0).await.unwrap(), Duration::ZERO);
    }
}
