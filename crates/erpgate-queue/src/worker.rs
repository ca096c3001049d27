//! Worker Pool for processing deliveries

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::backend::{Delivery, QueueBackend, QueueError};

const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Maximum deliveries handled at once
    pub max_concurrency: usize,
    /// Sleep between polls while the queue is empty
    pub poll_interval: Duration,
    /// How often a running handler's lock is extended; keep it well under
    /// the broker's lock duration
    pub lock_renewal_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(100),
            lock_renewal_interval: Duration::from_secs(10),
        }
    }
}

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the message is removed
    Complete,
    /// Release the lock; the message is redelivered after `delay`
    Abandon { delay: Option<Duration> },
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

pub struct WorkerPool<B: QueueBackend + ?Sized> {
    pub backend: Arc<B>,
    config: WorkerConfig,
}

impl<B: QueueBackend + 'static> WorkerPool<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> WorkerPool<B> {
    /// Create new worker pool from existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, config: WorkerConfig) -> Self {
        Self { backend, config }
    }

    /// Receive and handle a single delivery inline.
    ///
    /// Returns `false` when nothing was visible.
    pub async fn process_next<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
    ) -> Result<bool, QueueError> {
        match self.backend.receive().await? {
            Some(delivery) => {
                let disposition = handle_with_renewal(
                    self.backend.as_ref(),
                    handler,
                    &delivery,
                    self.config.lock_renewal_interval,
                )
                .await;
                settle(self.backend.as_ref(), &delivery, disposition).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run until `shutdown` resolves, then wait for in-flight deliveries.
    pub async fn run<H, S>(&self, handler: Arc<H>, shutdown: S)
    where
        H: MessageHandler + ?Sized + 'static,
        S: Future<Output = ()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut in_flight = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            max_concurrency = self.config.max_concurrency,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Reap finished handlers so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}

            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.backend.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let backend = self.backend.clone();
                    let handler = handler.clone();
                    let renew_every = self.config.lock_renewal_interval;
                    in_flight.spawn(async move {
                        let disposition = handle_with_renewal(
                            backend.as_ref(),
                            handler.as_ref(),
                            &delivery,
                            renew_every,
                        )
                        .await;
                        settle(backend.as_ref(), &delivery, disposition).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Worker pool draining");
        while in_flight.join_next().await.is_some() {}
        info!("Worker pool stopped");
    }
}

/// Run the handler while renewing the delivery's lock every `renew_every`.
async fn handle_with_renewal<B, H>(
    backend: &B,
    handler: &H,
    delivery: &Delivery,
    renew_every: Duration,
) -> Disposition
where
    B: QueueBackend + ?Sized,
    H: MessageHandler + ?Sized,
{
    let handling = handler.handle(delivery);
    tokio::pin!(handling);

    let renew_every = renew_every.max(MIN_RENEWAL_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewing = true;

    loop {
        tokio::select! {
            disposition = &mut handling => return disposition,
            _ = ticker.tick(), if renewing => {
                match backend.renew_lock(delivery).await {
                    Ok(()) => {}
                    Err(QueueError::LockLost(id)) => {
                        // Another consumer may hold it now
                        warn!(message_id = %id, "lock lost while handling, message may be redelivered");
                        renewing = false;
                    }
                    Err(e) => {
                        warn!(message_id = %delivery.message_id, error = %e, "lock renewal failed");
                    }
                }
            }
        }
    }
}

async fn settle<B: QueueBackend + ?Sized>(
    backend: &B,
    delivery: &Delivery,
    disposition: Disposition,
) {
    let result = match disposition {
        Disposition::Complete => backend.complete(delivery).await,
        Disposition::Abandon { delay } => backend.abandon(delivery, delay).await,
    };

    match result {
        Ok(()) => {}
        Err(QueueError::LockLost(id)) => {
            warn!(message_id = %id, ?disposition, "Lock lost before settlement, message will be redelivered");
        }
        Err(e) => {
            error!(message_id = %delivery.message_id, ?disposition, error = %e, "Failed to settle message");
        }
    }
}
