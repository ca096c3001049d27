//! In-memory peek-lock broker

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BrokerConfig, Delivery, OutboundMessage, QueueBackend, QueueError};

/// Priority entry for the heap - orders by visibility time (earliest first)
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    visible_at: Instant,
    seq: u64,
    id: Uuid,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier visible_at = higher priority
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct StoredMessage {
    message: OutboundMessage,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    /// Sequence of the heap entry that currently represents this message
    seq: u64,
    lock: Option<(Uuid, Instant)>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: HashMap<Uuid, StoredMessage>,
    ready: BinaryHeap<PriorityEntry>,
    dead_letters: Vec<OutboundMessage>,
    next_seq: u64,
}

impl QueueState {
    fn schedule(&mut self, id: Uuid, visible_at: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(stored) = self.messages.get_mut(&id) {
            stored.seq = seq;
            self.ready.push(PriorityEntry { visible_at, seq, id });
        }
    }

    /// Return messages whose lock expired to the ready heap.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|(_, m)| matches!(m.lock, Some((_, until)) if until <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(stored) = self.messages.get_mut(&id) {
                stored.lock = None;
            }
            debug!(message_id = %id, "lock expired, message visible again");
            self.schedule(id, now);
        }
    }

    /// Validate a settlement attempt against the current lock holder.
    fn locked_by(&self, delivery: &Delivery, now: Instant) -> Result<(), QueueError> {
        match self.messages.get(&delivery.message_id) {
            Some(StoredMessage {
                lock: Some((token, until)),
                ..
            }) if *token == delivery.lock_token && *until > now => Ok(()),
            _ => Err(QueueError::LockLost(delivery.message_id)),
        }
    }
}

/// Process-local broker with lock tokens, delivery counting, delayed
/// redelivery and a dead-letter list.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    config: BrokerConfig,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Messages not yet completed or dead-lettered (locked ones included)
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bodies of every message currently held, locked or not
    pub async fn pending_bodies(&self) -> Vec<serde_json::Value> {
        let state = self.state.lock().await;
        state
            .messages
            .values()
            .map(|m| m.message.body.clone())
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn send(&self, message: OutboundMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let id = message.message_id;
        if state.messages.contains_key(&id) {
            debug!(message_id = %id, "duplicate message id suppressed");
            return Ok(());
        }

        state.messages.insert(
            id,
            StoredMessage {
                message,
                enqueued_at: Utc::now(),
                delivery_count: 0,
                seq: 0,
                lock: None,
            },
        );
        state.schedule(id, Instant::now());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        state.reclaim_expired(now);

        while let Some(entry) = state.ready.peek() {
            if entry.visible_at > now {
                break;
            }
            let Some(entry) = state.ready.pop() else {
                break;
            };

            let exhausted = match state.messages.get(&entry.id) {
                // Stale heap entry or already locked
                Some(m) if m.seq != entry.seq || m.lock.is_some() => continue,
                None => continue,
                Some(m) => m.delivery_count >= self.config.max_delivery_count,
            };

            if exhausted {
                if let Some(stored) = state.messages.remove(&entry.id) {
                    warn!(
                        message_id = %entry.id,
                        delivery_count = stored.delivery_count,
                        "max delivery count reached, dead-lettering message"
                    );
                    state.dead_letters.push(stored.message);
                }
                continue;
            }

            let lock_token = Uuid::new_v4();
            let lock_duration = self.config.lock_duration;
            if let Some(stored) = state.messages.get_mut(&entry.id) {
                stored.delivery_count += 1;
                stored.lock = Some((lock_token, now + lock_duration));
                return Ok(Some(Delivery {
                    message_id: entry.id,
                    lock_token,
                    body: stored.message.body.clone(),
                    properties: stored.message.properties.clone(),
                    delivery_count: stored.delivery_count,
                    enqueued_at: stored.enqueued_at,
                }));
            }
        }

        Ok(None)
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.locked_by(delivery, Instant::now())?;
        state.messages.remove(&delivery.message_id);
        Ok(())
    }

    async fn abandon(
        &self,
        delivery: &Delivery,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        state.locked_by(delivery, now)?;

        if let Some(stored) = state.messages.get_mut(&delivery.message_id) {
            stored.lock = None;
        }
        state.schedule(delivery.message_id, now + delay.unwrap_or_default());
        Ok(())
    }

    async fn renew_lock(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.locked_by(delivery, now)?;

        let until = now + self.config.lock_duration;
        if let Some(stored) = state.messages.get_mut(&delivery.message_id) {
            stored.lock = Some((delivery.lock_token, until));
        }
        debug!(message_id = %delivery.message_id, "lock renewed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn message(body: serde_json::Value) -> OutboundMessage {
        OutboundMessage {
            message_id: Uuid::new_v4(),
            body,
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_receive_locks_until_complete() {
        let queue = MemoryQueue::new();
        queue.send(message(json!({ "foo": "bar" }))).await.unwrap();

        let delivery = queue.receive().await.unwrap().expect("Should have message");
        assert_eq!(delivery.body, json!({ "foo": "bar" }));
        assert_eq!(delivery.delivery_count, 1);

        // Locked: invisible to other consumers
        assert!(queue.receive().await.unwrap().is_none());

        queue.complete(&delivery).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_suppressed() {
        let queue = MemoryQueue::new();
        let msg = message(json!({}));
        queue.send(msg.clone()).await.unwrap();
        queue.send(msg).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_with_delay_redelivers_later() {
        let queue = MemoryQueue::new();
        queue.send(message(json!({ "n": 1 }))).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue
            .abandon(&first, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(queue.receive().await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(2)).await;

        let second = queue.receive().await.unwrap().expect("redelivered");
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(second.lock_token, first.lock_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_redelivered_and_old_token_rejected() {
        let queue = MemoryQueue::with_config(BrokerConfig {
            lock_duration: Duration::from_secs(5),
            max_delivery_count: 10,
        });
        queue.send(message(json!({}))).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let second = queue.receive().await.unwrap().expect("lock expired");
        assert_eq!(second.delivery_count, 2);

        assert!(matches!(
            queue.complete(&first).await,
            Err(QueueError::LockLost(_))
        ));
        queue.complete(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lock_outlives_original_duration() {
        let queue = MemoryQueue::with_config(BrokerConfig {
            lock_duration: Duration::from_secs(5),
            max_delivery_count: 10,
        });
        queue.send(message(json!({}))).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(4)).await;
            queue.renew_lock(&delivery).await.unwrap();
        }

        // 12s after receipt, still held
        assert!(queue.receive().await.unwrap().is_none());
        queue.complete(&delivery).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_expiry_is_lock_lost() {
        let queue = MemoryQueue::with_config(BrokerConfig {
            lock_duration: Duration::from_secs(5),
            max_delivery_count: 10,
        });
        queue.send(message(json!({}))).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(matches!(
            queue.renew_lock(&delivery).await,
            Err(QueueError::LockLost(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_deliveries() {
        let queue = MemoryQueue::with_config(BrokerConfig {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 2,
        });
        queue.send(message(json!({ "poison": true }))).await.unwrap();

        for _ in 0..2 {
            let delivery = queue.receive().await.unwrap().unwrap();
            queue.abandon(&delivery, None).await.unwrap();
        }

        assert!(queue.receive().await.unwrap().is_none());
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, json!({ "poison": true }));
    }

    #[tokio::test]
    async fn test_fifo_among_visible_messages() {
        let queue = MemoryQueue::new();
        for n in 0..3 {
            queue.send(message(json!({ "n": n }))).await.unwrap();
        }
        for n in 0..3 {
            let delivery = queue.receive().await.unwrap().unwrap();
            assert_eq!(delivery.body, json!({ "n": n }));
        }
    }
}
