//! Job store trait and error types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erpgate_queue::{JobId, JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A state change applied to a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// Message received; `attempt` is the broker delivery count
    Processing { attempt: u32 },
    /// Result stored, error cleared
    Succeeded { result: serde_json::Value },
    /// Transient failure; the job waits for redelivery with the error visible
    Requeued { error: String },
    /// Terminal failure
    Failed { error: String },
}

impl JobTransition {
    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Processing { .. } => JobStatus::Processing,
            JobTransition::Succeeded { .. } => JobStatus::Succeeded,
            JobTransition::Requeued { .. } => JobStatus::Queued,
            JobTransition::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Statuses this transition may start from.
    pub fn sources(&self) -> Vec<JobStatus> {
        let target = self.target();
        [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(target))
        .collect()
    }

    /// Apply to an in-memory record after the source status was checked.
    pub fn apply(&self, job: &mut JobRecord, now: DateTime<Utc>) {
        match self {
            JobTransition::Processing { attempt } => job.attempts = *attempt,
            JobTransition::Succeeded { result } => {
                job.result = Some(result.clone());
                job.error = None;
            }
            JobTransition::Requeued { error } | JobTransition::Failed { error } => {
                job.error = Some(erpgate_queue::truncate_error(error));
            }
        }
        job.status = self.target();
        job.updated_at = now;
    }
}

/// Per-entity record of the newest unsent update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBuffer {
    pub entity_id: String,
    /// Last writer wins
    pub latest_payload: serde_json::Value,
    pub pending: bool,
    /// Job currently responsible for flushing this buffer
    pub last_job_id: Option<JobId>,
    /// Bumped on every write; the flusher's compare-on-write token
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

/// Result of recording an update against the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// A flush was already pending; its job will send the merged payload
    Merged { job_id: JobId },
    /// The candidate job was inserted and now owns the flush
    Scheduled { job_id: JobId },
}

impl CoalesceOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            CoalesceOutcome::Merged { job_id } | CoalesceOutcome::Scheduled { job_id } => *job_id,
        }
    }
}

/// Durable store for jobs, idempotency keys, update buffers and admission
/// windows. Every method is a single atomic unit.
#[async_trait]
pub trait JobStore: Send + Sync + Debug {
    /// Get the backend name
    fn name(&self) -> &str;

    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StorageError>;

    /// Apply a state-machine transition, rejecting edges the machine forbids.
    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<JobRecord, StorageError>;

    // Idempotency index

    /// Insert the job and bind `(vendor, key)` to it in one unit.
    /// Fails with `AlreadyExists` if the key is already bound.
    async fn insert_job_with_idempotency_key(
        &self,
        job: &JobRecord,
        key: &str,
    ) -> Result<(), StorageError>;

    async fn find_idempotent_job(
        &self,
        vendor_id: &str,
        key: &str,
    ) -> Result<Option<JobId>, StorageError>;

    /// Flip a `failed` job with zero attempts back to `queued`.
    async fn requeue_unattempted(&self, id: JobId) -> Result<bool, StorageError>;

    // Update coalescing buffer

    async fn get_update_buffer(&self, entity_id: &str)
        -> Result<Option<UpdateBuffer>, StorageError>;

    /// Merge into a pending buffer, or insert `candidate` and make it the flusher.
    async fn coalesce_update(
        &self,
        entity_id: &str,
        payload: serde_json::Value,
        candidate: &JobRecord,
    ) -> Result<CoalesceOutcome, StorageError>;

    /// Clear `pending` only if the buffer is still at `revision`.
    async fn settle_update_buffer(
        &self,
        entity_id: &str,
        revision: i64,
    ) -> Result<bool, StorageError>;

    /// Insert a follow-up job and hand it the flush.
    async fn schedule_follow_up(&self, entity_id: &str, job: &JobRecord)
        -> Result<(), StorageError>;

    /// Fail a flusher job and clear `pending` if the job still owns the buffer.
    async fn fail_scheduled_update(
        &self,
        job_id: JobId,
        entity_id: &str,
        error: &str,
    ) -> Result<(), StorageError>;

    // Admission windows

    /// Increment and return the counter for a fixed window.
    async fn increment_rate_window(
        &self,
        vendor_id: &str,
        route_key: &str,
        window_start: i64,
    ) -> Result<u32, StorageError>;
}
