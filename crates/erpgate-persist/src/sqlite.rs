//! SQLite job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erpgate_queue::{truncate_error, JobId, JobRecord, JobStatus, JobType};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::backend::{CoalesceOutcome, JobStore, JobTransition, StorageError, UpdateBuffer};

const JOB_COLUMNS: &str = "id, vendor_id, job_type, status, entity_key, payload, result, error, attempts, created_at, updated_at";

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:erpgate.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Enable foreign key enforcement
    pub foreign_keys: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:erpgate.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            foreign_keys: true,
            busy_timeout_secs: 5,
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

fn insert_err(e: sqlx::Error, what: String) -> StorageError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::AlreadyExists(what),
        other => query_err(other),
    }
}

fn to_json(value: &serde_json::Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json(text: &str) -> Result<serde_json::Value, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_uuid(text: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(text).map_err(|_| StorageError::Serialization(format!("invalid uuid: {}", text)))
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, StorageError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let job_type: String = row.try_get("job_type").map_err(query_err)?;
    let status: String = row.try_get("status").map_err(query_err)?;
    let payload: Option<String> = row.try_get("payload").map_err(query_err)?;
    let result: Option<String> = row.try_get("result").map_err(query_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(query_err)?;

    Ok(JobRecord {
        id: parse_uuid(&id)?,
        vendor_id: row.try_get("vendor_id").map_err(query_err)?,
        job_type: job_type.parse::<JobType>().map_err(StorageError::Serialization)?,
        status: status.parse::<JobStatus>().map_err(StorageError::Serialization)?,
        entity_key: row.try_get("entity_key").map_err(query_err)?,
        payload: payload.as_deref().map(from_json).transpose()?,
        result: result.as_deref().map(from_json).transpose()?,
        error: row.try_get("error").map_err(query_err)?,
        attempts: attempts as u32,
        created_at: row.try_get("created_at").map_err(query_err)?,
        updated_at: row.try_get("updated_at").map_err(query_err)?,
    })
}

fn buffer_from_row(row: &SqliteRow) -> Result<UpdateBuffer, StorageError> {
    let payload: String = row.try_get("latest_payload").map_err(query_err)?;
    let pending: i64 = row.try_get("pending").map_err(query_err)?;
    let last_job_id: Option<String> = row.try_get("last_job_id").map_err(query_err)?;

    Ok(UpdateBuffer {
        entity_id: row.try_get("entity_id").map_err(query_err)?,
        latest_payload: from_json(&payload)?,
        pending: pending != 0,
        last_job_id: last_job_id.as_deref().map(parse_uuid).transpose()?,
        revision: row.try_get("revision").map_err(query_err)?,
        updated_at: row.try_get("updated_at").map_err(query_err)?,
    })
}

async fn insert_job_in(conn: &mut SqliteConnection, job: &JobRecord) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO jobs (id, vendor_id, job_type, status, entity_key, payload, result, error, attempts, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job.id.to_string())
    .bind(&job.vendor_id)
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(&job.entity_key)
    .bind(job.payload.as_ref().map(to_json).transpose()?)
    .bind(job.result.as_ref().map(to_json).transpose()?)
    .bind(&job.error)
    .bind(job.attempts as i64)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| insert_err(e, format!("job {}", job.id)))?;
    Ok(())
}

async fn transition_in(
    conn: &mut SqliteConnection,
    id: JobId,
    transition: &JobTransition,
) -> Result<JobRecord, StorageError> {
    let sources = transition
        .sources()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let set = match transition {
        JobTransition::Processing { .. } => "attempts = ?",
        JobTransition::Succeeded { .. } => "result = ?, error = NULL",
        JobTransition::Requeued { .. } | JobTransition::Failed { .. } => "error = ?",
    };
    let sql = format!(
        "UPDATE jobs SET status = ?, {set}, updated_at = ? WHERE id = ? AND status IN ({sources}) RETURNING {JOB_COLUMNS}"
    );

    let query = sqlx::query(&sql).bind(transition.target().as_str());
    let query = match transition {
        JobTransition::Processing { attempt } => query.bind(*attempt as i64),
        JobTransition::Succeeded { result } => query.bind(to_json(result)?),
        JobTransition::Requeued { error } | JobTransition::Failed { error } => {
            query.bind(truncate_error(error))
        }
    };

    let row = query
        .bind(Utc::now())
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;

    if let Some(row) = row {
        return job_from_row(&row);
    }

    let current: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;
    match current {
        None => Err(StorageError::NotFound(format!("job {}", id))),
        Some(status) => Err(StorageError::InvalidTransition {
            job_id: id,
            from: status.parse::<JobStatus>().map_err(StorageError::Serialization)?,
            to: transition.target(),
        }),
    }
}

/// SQLite-backed job store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with default config
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let config = SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::new_with_config(config).await
    }

    /// Create a new store with full configuration and run migrations
    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        if config.foreign_keys {
            options = options.pragma("foreign_keys", "ON");
        }
        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());

        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Each in-memory connection is its own database; never recycle it
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Internal(format!("Migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        insert_job_in(&mut *conn, job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<JobRecord, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        transition_in(&mut *conn, id, &transition).await
    }

    async fn insert_job_with_idempotency_key(
        &self,
        job: &JobRecord,
        key: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        insert_job_in(&mut *tx, job).await?;
        sqlx::query(
            "INSERT INTO idempotency_keys (vendor_id, idempotency_key, job_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&job.vendor_id)
        .bind(key)
        .bind(job.id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_err(e, format!("idempotency key {}", key)))?;
        tx.commit().await.map_err(query_err)
    }

    async fn find_idempotent_job(
        &self,
        vendor_id: &str,
        key: &str,
    ) -> Result<Option<JobId>, StorageError> {
        let job_id: Option<String> = sqlx::query_scalar(
            "SELECT job_id FROM idempotency_keys WHERE vendor_id = ? AND idempotency_key = ?",
        )
        .bind(vendor_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        job_id.as_deref().map(parse_uuid).transpose()
    }

    async fn requeue_unattempted(&self, id: JobId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', error = NULL, updated_at = ? \
             WHERE id = ? AND status = 'failed' AND attempts = 0",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_update_buffer(
        &self,
        entity_id: &str,
    ) -> Result<Option<UpdateBuffer>, StorageError> {
        let row = sqlx::query(
            "SELECT entity_id, latest_payload, pending, last_job_id, revision, updated_at \
             FROM update_buffers WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(buffer_from_row).transpose()
    }

    async fn coalesce_update(
        &self,
        entity_id: &str,
        payload: serde_json::Value,
        candidate: &JobRecord,
    ) -> Result<CoalesceOutcome, StorageError> {
        let payload = to_json(&payload)?;
        let now: DateTime<Utc> = Utc::now();
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        // Write first so the transaction holds the write lock before it reads
        let merged: Option<String> = sqlx::query_scalar(
            "UPDATE update_buffers SET latest_payload = ?, revision = revision + 1, updated_at = ? \
             WHERE entity_id = ? AND pending = 1 AND last_job_id IS NOT NULL \
             RETURNING last_job_id",
        )
        .bind(&payload)
        .bind(now)
        .bind(entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;

        if let Some(job_id) = merged {
            tx.commit().await.map_err(query_err)?;
            return Ok(CoalesceOutcome::Merged {
                job_id: parse_uuid(&job_id)?,
            });
        }

        insert_job_in(&mut *tx, candidate).await?;
        sqlx::query(
            "INSERT INTO update_buffers (entity_id, latest_payload, pending, last_job_id, revision, updated_at) \
             VALUES (?, ?, 1, ?, 1, ?) \
             ON CONFLICT(entity_id) DO UPDATE SET \
                latest_payload = excluded.latest_payload, \
                pending = 1, \
                last_job_id = excluded.last_job_id, \
                revision = update_buffers.revision + 1, \
                updated_at = excluded.updated_at",
        )
        .bind(entity_id)
        .bind(&payload)
        .bind(candidate.id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        Ok(CoalesceOutcome::Scheduled {
            job_id: candidate.id,
        })
    }

    async fn settle_update_buffer(
        &self,
        entity_id: &str,
        revision: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE update_buffers SET pending = 0, updated_at = ? \
             WHERE entity_id = ? AND pending = 1 AND revision = ?",
        )
        .bind(Utc::now())
        .bind(entity_id)
        .bind(revision)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn schedule_follow_up(
        &self,
        entity_id: &str,
        job: &JobRecord,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        insert_job_in(&mut *tx, job).await?;
        let result = sqlx::query("UPDATE update_buffers SET last_job_id = ? WHERE entity_id = ?")
            .bind(job.id.to_string())
            .bind(entity_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("update buffer {}", entity_id)));
        }
        tx.commit().await.map_err(query_err)
    }

    async fn fail_scheduled_update(
        &self,
        job_id: JobId,
        entity_id: &str,
        error: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        transition_in(
            &mut *tx,
            job_id,
            &JobTransition::Failed {
                error: error.to_string(),
            },
        )
        .await?;
        sqlx::query(
            "UPDATE update_buffers SET pending = 0, updated_at = ? WHERE entity_id = ? AND last_job_id = ?",
        )
        .bind(Utc::now())
        .bind(entity_id)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)
    }

    async fn increment_rate_window(
        &self,
        vendor_id: &str,
        route_key: &str,
        window_start: i64,
    ) -> Result<u32, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO rate_limit_windows (vendor_id, route_key, window_start, count) VALUES (?, ?, ?, 1) \
             ON CONFLICT(vendor_id, route_key, window_start) DO UPDATE SET count = count + 1 \
             RETURNING count",
        )
        .bind(vendor_id)
        .bind(route_key)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(count as u32)
    }
}
