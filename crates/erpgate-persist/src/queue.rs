//! Durable peek-lock queue on SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erpgate_queue::{BrokerConfig, Delivery, OutboundMessage, QueueBackend, QueueError};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

fn backend_err(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable queue backend using the `queue_messages` table
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    config: BrokerConfig,
}

impl SqliteQueue {
    /// The pool must come from a migrated `SqliteStore`
    pub fn new(pool: SqlitePool, config: BrokerConfig) -> Self {
        Self { pool, config }
    }

    pub async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE dead_lettered = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;
        Ok(count as u64)
    }

    /// Park messages that exhausted their deliveries and are not locked.
    async fn dead_letter_exhausted(&self, now: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE queue_messages SET dead_lettered = 1, lock_token = NULL, locked_until = NULL \
             WHERE dead_lettered = 0 AND delivery_count >= ? AND visible_at <= ? \
             AND (lock_token IS NULL OR locked_until <= ?)",
        )
        .bind(self.config.max_delivery_count as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() > 0 {
            warn!(
                count = result.rows_affected(),
                max_delivery_count = self.config.max_delivery_count,
                "max delivery count reached, dead-lettering messages"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn send(&self, message: OutboundMessage) -> Result<(), QueueError> {
        let body = serde_json::to_string(&message.body)?;
        let properties = serde_json::to_string(&message.properties)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO queue_messages (message_id, body, properties, visible_at, enqueued_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.message_id.to_string())
        .bind(body)
        .bind(properties)
        .bind(now_ms())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            debug!(message_id = %message.message_id, "duplicate message id suppressed");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = now_ms();
        self.dead_letter_exhausted(now).await?;

        let lock_token = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lock_token = ?,
                locked_until = ?,
                delivery_count = delivery_count + 1
            WHERE seq = (
                SELECT seq FROM queue_messages
                WHERE dead_lettered = 0
                  AND visible_at <= ?
                  AND (lock_token IS NULL OR locked_until <= ?)
                ORDER BY visible_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING message_id, body, properties, delivery_count, enqueued_at
            "#,
        )
        .bind(lock_token.to_string())
        .bind(now + self.config.lock_duration.as_millis() as i64)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: String = row.try_get("message_id").map_err(backend_err)?;
        let body: String = row.try_get("body").map_err(backend_err)?;
        let properties: String = row.try_get("properties").map_err(backend_err)?;
        let delivery_count: i64 = row.try_get("delivery_count").map_err(backend_err)?;
        let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(backend_err)?;

        Ok(Some(Delivery {
            message_id: Uuid::parse_str(&message_id)
                .map_err(|_| QueueError::Backend("Invalid UUID".into()))?,
            lock_token,
            body: serde_json::from_str(&body)?,
            properties: serde_json::from_str::<BTreeMap<String, String>>(&properties)?,
            delivery_count: delivery_count as u32,
            enqueued_at,
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE message_id = ? AND lock_token = ? AND locked_until > ?",
        )
        .bind(delivery.message_id.to_string())
        .bind(delivery.lock_token.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LockLost(delivery.message_id));
        }
        Ok(())
    }

    async fn abandon(
        &self,
        delivery: &Delivery,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let now = now_ms();
        let visible_at = now + delay.unwrap_or_default().as_millis() as i64;

        let result = sqlx::query(
            "UPDATE queue_messages SET lock_token = NULL, locked_until = NULL, visible_at = ? \
             WHERE message_id = ? AND lock_token = ? AND locked_until > ?",
        )
        .bind(visible_at)
        .bind(delivery.message_id.to_string())
        .bind(delivery.lock_token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LockLost(delivery.message_id));
        }
        Ok(())
    }

    async fn renew_lock(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE queue_messages SET locked_until = ? \
             WHERE message_id = ? AND lock_token = ? AND locked_until > ?",
        )
        .bind(now + self.config.lock_duration.as_millis() as i64)
        .bind(delivery.message_id.to_string())
        .bind(delivery.lock_token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LockLost(delivery.message_id));
        }
        debug!(message_id = %delivery.message_id, "lock renewed");
        Ok(())
    }
}
