//! Consumer side of the update coalescing buffer
//!
//! A flush waits until the entity's buffer has been quiet for the debounce
//! window, sends whatever payload is latest at that moment, then clears
//! `pending` only if no edit landed while the upstream call was in flight.
//! If one did, a follow-up job is scheduled so the newer payload is sent too.

use chrono::Utc;
use erpgate_persist::{JobStore, JobTransition, UpdateBuffer};
use erpgate_queue::{publish_job, JobMessage, JobRecord, QueueBackend};
use erpgate_upstream::UpstreamError;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::JobError;

/// Shortest sleep between buffer re-checks
const MIN_POLL: Duration = Duration::from_millis(25);

pub struct UpdateFlusher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueBackend>,
    window: Duration,
}

impl UpdateFlusher {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn QueueBackend>, window: Duration) -> Self {
        Self {
            store,
            queue,
            window,
        }
    }

    /// Sleep until the pending buffer's last write is at least one window
    /// old. Returns `None` when there is no pending buffer.
    async fn wait_for_quiet(&self, entity_id: &str) -> Result<Option<UpdateBuffer>, JobError> {
        loop {
            let buffer = match self.store.get_update_buffer(entity_id).await? {
                Some(buffer) if buffer.pending => buffer,
                _ => return Ok(None),
            };

            let age = (Utc::now() - buffer.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age >= self.window {
                return Ok(Some(buffer));
            }

            let remaining = self.window - age;
            debug!(entity_id, remaining_ms = remaining.as_millis() as u64, "debouncing update");
            tokio::time::sleep(remaining.max(MIN_POLL)).await;
        }
    }

    /// Flush the entity's buffered update through `send`.
    ///
    /// Coalesced messages carry no payload of their own. Without a pending
    /// buffer a single-shot message sends its submitted payload. A payload-less
    /// message whose buffer is already settled has nothing left to send, which
    /// happens when a flush is redelivered after it reached the ERP.
    pub async fn flush<F, Fut>(
        &self,
        message: &JobMessage,
        entity_id: &str,
        send: F,
    ) -> Result<Value, JobError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        let Some(buffer) = self.wait_for_quiet(entity_id).await? else {
            if let Some(payload) = message.payload.clone() {
                debug!(job_id = %message.job_id, entity_id, "no pending buffer, sending submitted payload");
                return Ok(send(payload).await?);
            }

            return match self.store.get_update_buffer(entity_id).await? {
                Some(settled) => {
                    info!(
                        job_id = %message.job_id,
                        entity_id,
                        revision = settled.revision,
                        "update buffer already flushed, nothing to send"
                    );
                    Ok(json!({ "coalesced": true, "alreadyFlushed": true }))
                }
                None => Err(JobError::Invalid(
                    "no buffered or submitted payload to send".to_string(),
                )),
            };
        };

        let revision = buffer.revision;
        let result = send(buffer.latest_payload).await?;

        if self.store.settle_update_buffer(entity_id, revision).await? {
            debug!(job_id = %message.job_id, entity_id, revision, "update buffer settled");
            return Ok(result);
        }

        // An edit landed during the upstream call; hand the flush on.
        match self.store.get_update_buffer(entity_id).await? {
            Some(current) if current.pending => {
                self.schedule_follow_up(message, &current).await?;
            }
            _ => {}
        }
        Ok(result)
    }

    async fn schedule_follow_up(
        &self,
        message: &JobMessage,
        current: &UpdateBuffer,
    ) -> Result<(), JobError> {
        let entity_id = current.entity_id.as_str();
        let job = JobRecord::queued(
            &message.vendor_id,
            message.job_type,
            Some(entity_id.to_string()),
            Some(current.latest_payload.clone()),
        );
        self.store.schedule_follow_up(entity_id, &job).await?;

        let follow_up =
            JobMessage::new(job.id, &message.vendor_id, job.job_type).with_opportunity(entity_id);

        if let Err(e) = publish_job(self.queue.as_ref(), &follow_up).await {
            // The buffer stays pending; redelivery of this job flushes it.
            error!(job_id = %job.id, entity_id, error = %e, "follow-up publish failed");
            self.store
                .transition(
                    job.id,
                    JobTransition::Failed {
                        error: format!("publish failed: {}", e),
                    },
                )
                .await?;
            return Err(e.into());
        }

        info!(
            job_id = %message.job_id,
            follow_up_job_id = %job.id,
            entity_id,
            revision = current.revision,
            "coalesced update superseded"
        );
        Ok(())
    }
}
