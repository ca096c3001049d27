//! Queue Backend Trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Message lock lost for {0}")]
    LockLost(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Peek-lock settings shared by every broker implementation.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// How long a received message stays invisible to other consumers
    pub lock_duration: Duration,
    /// Deliveries after which a message is dead-lettered instead of redelivered
    pub max_delivery_count: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
        }
    }
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Broker-side identity; sending the same id twice is a no-op.
    pub message_id: Uuid,
    pub body: serde_json::Value,
    pub properties: BTreeMap<String, String>,
}

/// A message received under a peek-lock.
///
/// The holder must `complete` or `abandon` it before the lock expires,
/// otherwise the broker redelivers it. Long handlers keep the lock alive
/// with `renew_lock`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub lock_token: Uuid,
    pub body: serde_json::Value,
    pub properties: BTreeMap<String, String>,
    /// 1 on first receipt, incremented on each redelivery
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Publish a message
    async fn send(&self, message: OutboundMessage) -> Result<(), QueueError>;

    /// Lock the next visible message, if any
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge and remove the message
    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Release the lock; the message becomes visible again after `delay`
    async fn abandon(&self, delivery: &Delivery, delay: Option<Duration>)
        -> Result<(), QueueError>;

    /// Extend the lock by a full lock duration from now.
    ///
    /// Fails with `LockLost` once the lock has expired or changed hands.
    async fn renew_lock(&self, delivery: &Delivery) -> Result<(), QueueError>;
}
