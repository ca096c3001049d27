//! Worker pool behaviour against the in-memory broker

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use erpgate_queue::backend::{BrokerConfig, Delivery, OutboundMessage, QueueBackend};
use erpgate_queue::memory::MemoryQueue;
use erpgate_queue::worker::{Disposition, MessageHandler, WorkerConfig, WorkerPool};
use serde_json::json;
use uuid::Uuid;

/// Counts executions; fails (abandons) the first `fail_times` deliveries
struct CounterHandler {
    counter: AtomicU32,
    fail_times: u32,
}

#[async_trait]
impl MessageHandler for CounterHandler {
    async fn handle(&self, _delivery: &Delivery) -> Disposition {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        if count < self.fail_times {
            Disposition::Abandon { delay: None }
        } else {
            Disposition::Complete
        }
    }
}

/// Tracks the highest number of concurrent handlers observed
struct SlowHandler {
    active: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _delivery: &Delivery) -> Disposition {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Disposition::Complete
    }
}

/// Runs longer than the broker's lock duration
struct LongHandler {
    calls: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl MessageHandler for LongHandler {
    async fn handle(&self, _delivery: &Delivery) -> Disposition {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(45)).await;
        self.done.fetch_add(1, Ordering::SeqCst);
        Disposition::Complete
    }
}

fn message(n: u32) -> OutboundMessage {
    OutboundMessage {
        message_id: Uuid::new_v4(),
        body: json!({ "n": n }),
        properties: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_process_next_abandon_then_complete() {
    let queue = Arc::new(MemoryQueue::new());
    queue.send(message(1)).await.unwrap();

    let pool = WorkerPool::new_with_arc(queue.clone(), WorkerConfig::default());
    let handler = CounterHandler {
        counter: AtomicU32::new(0),
        fail_times: 2,
    };

    assert!(pool.process_next(&handler).await.unwrap());
    assert!(pool.process_next(&handler).await.unwrap());
    assert_eq!(queue.len().await, 1, "abandoned message is still queued");

    assert!(pool.process_next(&handler).await.unwrap());
    assert!(queue.is_empty().await);
    assert!(!pool.process_next(&handler).await.unwrap());
    assert_eq!(handler.counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_run_respects_concurrency_and_drains_on_shutdown() {
    let queue = Arc::new(MemoryQueue::new());
    for n in 0..12 {
        queue.send(message(n)).await.unwrap();
    }

    let pool = WorkerPool::new_with_arc(
        queue.clone(),
        WorkerConfig {
            max_concurrency: 3,
            poll_interval: Duration::from_millis(5),
            ..WorkerConfig::default()
        },
    );
    let handler = Arc::new(SlowHandler {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });

    let watched = handler.clone();
    let shutdown = async move {
        while watched.done.load(Ordering::SeqCst) < 12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), pool.run(handler.clone(), shutdown))
        .await
        .expect("pool should stop after shutdown");

    assert_eq!(handler.done.load(Ordering::SeqCst), 12);
    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert!(queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_long_handler_keeps_its_lock() {
    let queue = Arc::new(MemoryQueue::with_config(BrokerConfig {
        lock_duration: Duration::from_secs(30),
        max_delivery_count: 10,
    }));
    queue.send(message(1)).await.unwrap();

    let pool = WorkerPool::new_with_arc(
        queue.clone(),
        WorkerConfig {
            max_concurrency: 2,
            poll_interval: Duration::from_millis(100),
            lock_renewal_interval: Duration::from_secs(10),
        },
    );
    let handler = Arc::new(LongHandler {
        calls: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });

    let watched = handler.clone();
    let shutdown = async move {
        while watched.done.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };
    pool.run(handler.clone(), shutdown).await;

    // A free worker polled throughout; the message was never redelivered
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty().await);
    assert!(queue.dead_letters().await.is_empty());
}
