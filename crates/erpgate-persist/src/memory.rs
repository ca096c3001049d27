//! In-memory job store (tests and single-process development)

use async_trait::async_trait;
use chrono::Utc;
use erpgate_queue::{JobId, JobRecord, JobStatus};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::backend::{CoalesceOutcome, JobStore, JobTransition, StorageError, UpdateBuffer};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, JobRecord>,
    idempotency: HashMap<(String, String), JobId>,
    buffers: HashMap<String, UpdateBuffer>,
    rate_windows: HashMap<(String, String, i64), u32>,
}

impl Tables {
    fn insert_job(&mut self, job: &JobRecord) -> Result<(), StorageError> {
        if self.jobs.contains_key(&job.id) {
            return Err(StorageError::AlreadyExists(format!("job {}", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn transition(
        &mut self,
        id: JobId,
        transition: &JobTransition,
    ) -> Result<JobRecord, StorageError> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))?;

        let to = transition.target();
        if !job.status.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                job_id: id,
                from: job.status,
                to,
            });
        }
        transition.apply(job, Utc::now());
        Ok(job.clone())
    }
}

/// Single-lock store; each method body is one critical section, which gives
/// it the same atomicity as a database transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.tables.lock().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        self.tables.lock().await.insert_job(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<JobRecord, StorageError> {
        self.tables.lock().await.transition(id, &transition)
    }

    async fn insert_job_with_idempotency_key(
        &self,
        job: &JobRecord,
        key: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let index_key = (job.vendor_id.clone(), key.to_string());
        if tables.idempotency.contains_key(&index_key) {
            return Err(StorageError::AlreadyExists(format!(
                "idempotency key {}",
                key
            )));
        }
        tables.insert_job(job)?;
        tables.idempotency.insert(index_key, job.id);
        Ok(())
    }

    async fn find_idempotent_job(
        &self,
        vendor_id: &str,
        key: &str,
    ) -> Result<Option<JobId>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .idempotency
            .get(&(vendor_id.to_string(), key.to_string()))
            .copied())
    }

    async fn requeue_unattempted(&self, id: JobId) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Failed && job.attempts == 0 => {
                job.status = JobStatus::Queued;
                job.error = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("job {}", id))),
        }
    }

    async fn get_update_buffer(
        &self,
        entity_id: &str,
    ) -> Result<Option<UpdateBuffer>, StorageError> {
        Ok(self.tables.lock().await.buffers.get(entity_id).cloned())
    }

    async fn coalesce_update(
        &self,
        entity_id: &str,
        payload: serde_json::Value,
        candidate: &JobRecord,
    ) -> Result<CoalesceOutcome, StorageError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        if let Some(buffer) = tables.buffers.get_mut(entity_id) {
            if let (true, Some(job_id)) = (buffer.pending, buffer.last_job_id) {
                buffer.latest_payload = payload;
                buffer.revision += 1;
                buffer.updated_at = now;
                return Ok(CoalesceOutcome::Merged { job_id });
            }
        }

        tables.insert_job(candidate)?;
        let buffer = tables
            .buffers
            .entry(entity_id.to_string())
            .or_insert_with(|| UpdateBuffer {
                entity_id: entity_id.to_string(),
                latest_payload: serde_json::Value::Null,
                pending: false,
                last_job_id: None,
                revision: 0,
                updated_at: now,
            });
        buffer.latest_payload = payload;
        buffer.pending = true;
        buffer.last_job_id = Some(candidate.id);
        buffer.revision += 1;
        buffer.updated_at = now;

        Ok(CoalesceOutcome::Scheduled {
            job_id: candidate.id,
        })
    }

    async fn settle_update_buffer(
        &self,
        entity_id: &str,
        revision: i64,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.buffers.get_mut(entity_id) {
            Some(buffer) if buffer.pending && buffer.revision == revision => {
                buffer.pending = false;
                buffer.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_follow_up(
        &self,
        entity_id: &str,
        job: &JobRecord,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        if !tables.buffers.contains_key(entity_id) {
            return Err(StorageError::NotFound(format!("update buffer {}", entity_id)));
        }
        tables.insert_job(job)?;
        if let Some(buffer) = tables.buffers.get_mut(entity_id) {
            buffer.last_job_id = Some(job.id);
        }
        Ok(())
    }

    async fn fail_scheduled_update(
        &self,
        job_id: JobId,
        entity_id: &str,
        error: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.transition(
            job_id,
            &JobTransition::Failed {
                error: error.to_string(),
            },
        )?;
        if let Some(buffer) = tables.buffers.get_mut(entity_id) {
            if buffer.last_job_id == Some(job_id) {
                buffer.pending = false;
                buffer.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn increment_rate_window(
        &self,
        vendor_id: &str,
        route_key: &str,
        window_start: i64,
    ) -> Result<u32, StorageError> {
        let mut tables = self.tables.lock().await;
        let count = tables
            .rate_windows
            .entry((vendor_id.to_string(), route_key.to_string(), window_start))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpgate_queue::JobType;
    use serde_json::json;
    use std::sync::Arc;

    fn update_job(entity: &str) -> JobRecord {
        JobRecord::queued(
            "specbooks",
            JobType::UpdateOpportunity,
            Some(entity.to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn test_transition_rejects_leaving_terminal_state() {
        let store = MemoryStore::new();
        let job = JobRecord::queued("specbooks", JobType::GetCustomer, None, None);
        store.insert_job(&job).await.unwrap();

        store
            .transition(job.id, JobTransition::Processing { attempt: 1 })
            .await
            .unwrap();
        store
            .transition(
                job.id,
                JobTransition::Succeeded {
                    result: json!({"id": "C1"}),
                },
            )
            .await
            .unwrap();

        let err = store
            .transition(job.id, JobTransition::Processing { attempt: 2 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: JobStatus::Succeeded,
                to: JobStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requeue_keeps_error_and_attempts() {
        let store = MemoryStore::new();
        let job = JobRecord::queued("specbooks", JobType::GetCustomer, None, None);
        store.insert_job(&job).await.unwrap();

        store
            .transition(job.id, JobTransition::Processing { attempt: 1 })
            .await
            .unwrap();
        let requeued = store
            .transition(
                job.id,
                JobTransition::Requeued {
                    error: "status 503".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.error.as_deref(), Some("status 503"));
        assert_eq!(requeued.attempts, 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_binds_once() {
        let store = MemoryStore::new();
        let first = JobRecord::queued("specbooks", JobType::CreateOpportunity, None, None);
        let second = JobRecord::queued("specbooks", JobType::CreateOpportunity, None, None);

        store
            .insert_job_with_idempotency_key(&first, "K1")
            .await
            .unwrap();
        let err = store
            .insert_job_with_idempotency_key(&second, "K1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        assert_eq!(store.job_count().await, 1);
        assert_eq!(
            store.find_idempotent_job("specbooks", "K1").await.unwrap(),
            Some(first.id)
        );
        // Keys are scoped per vendor
        assert_eq!(store.find_idempotent_job("other", "K1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requeue_unattempted_only_for_never_attempted_failures() {
        let store = MemoryStore::new();
        let job = JobRecord::queued("specbooks", JobType::CreateOpportunity, None, None);
        store.insert_job(&job).await.unwrap();
        store
            .transition(
                job.id,
                JobTransition::Failed {
                    error: "publish failed".into(),
                },
            )
            .await
            .unwrap();

        assert!(store.requeue_unattempted(job.id).await.unwrap());
        assert!(!store.requeue_unattempted(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_coalesce_merges_into_pending_buffer() {
        let store = MemoryStore::new();
        let first = update_job("E1");
        let second = update_job("E1");

        let outcome = store
            .coalesce_update("E1", json!({"a": 1}), &first)
            .await
            .unwrap();
        assert_eq!(outcome, CoalesceOutcome::Scheduled { job_id: first.id });

        let outcome = store
            .coalesce_update("E1", json!({"a": 1, "b": 2}), &second)
            .await
            .unwrap();
        assert_eq!(outcome, CoalesceOutcome::Merged { job_id: first.id });

        let buffer = store.get_update_buffer("E1").await.unwrap().unwrap();
        assert_eq!(buffer.latest_payload, json!({"a": 1, "b": 2}));
        assert_eq!(buffer.revision, 2);
        assert!(buffer.pending);
        assert_eq!(store.job_count().await, 1);
    }

    #[tokio::test]
    async fn test_settle_guards_against_newer_writes() {
        let store = MemoryStore::new();
        store
            .coalesce_update("E1", json!({"a": 1}), &update_job("E1"))
            .await
            .unwrap();
        let read = store.get_update_buffer("E1").await.unwrap().unwrap();

        // A newer edit lands while the flush is in flight
        store
            .coalesce_update("E1", json!({"a": 2}), &update_job("E1"))
            .await
            .unwrap();

        assert!(!store.settle_update_buffer("E1", read.revision).await.unwrap());
        let current = store.get_update_buffer("E1").await.unwrap().unwrap();
        assert!(current.pending);
        assert!(store
            .settle_update_buffer("E1", current.revision)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fail_scheduled_update_releases_only_owned_buffer() {
        let store = MemoryStore::new();
        let job = update_job("E1");
        store
            .coalesce_update("E1", json!({"a": 1}), &job)
            .await
            .unwrap();

        store
            .fail_scheduled_update(job.id, "E1", "queue unavailable")
            .await
            .unwrap();

        let buffer = store.get_update_buffer("E1").await.unwrap().unwrap();
        assert!(!buffer.pending);
        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 0);
    }

    #[tokio::test]
    async fn test_rate_window_counts_per_key() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_rate_window("specbooks", "GET_CUSTOMER", 1_700_000_000)
                    .await
                    .unwrap()
            }));
        }
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort();
        assert_eq!(counts, (1..=10).collect::<Vec<u32>>());

        let other = store
            .increment_rate_window("specbooks", "GET_CUSTOMER", 1_700_000_060)
            .await
            .unwrap();
        assert_eq!(other, 1);
    }
}
