//! Delivery handling: parse, mark processing, govern, dispatch, settle

use async_trait::async_trait;
use erpgate_persist::{JobStore, JobTransition, StorageError};
use erpgate_queue::{
    Delivery, Disposition, JobId, JobMessage, MessageError, MessageHandler, QueueBackend,
};
use erpgate_upstream::{ErpClient, RateGovernor};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::coalesce::UpdateFlusher;
use crate::config::ProcessorConfig;
use crate::dispatcher::JobDispatcher;
use crate::error::JobError;

/// Executes one job per delivery and records the outcome on the job.
///
/// | Outcome | Job status | Message |
/// |---|---|---|
/// | success | `succeeded` | complete |
/// | transient, below the delivery ceiling | `queued` | abandon with backoff |
/// | terminal, or ceiling reached | `failed` | complete |
/// | store, queue or governor failure | unchanged | abandon |
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    governor: Arc<RateGovernor>,
    dispatcher: JobDispatcher,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueBackend>,
        erp: Arc<dyn ErpClient>,
        governor: Arc<RateGovernor>,
        config: ProcessorConfig,
    ) -> Self {
        let flusher = UpdateFlusher::new(store.clone(), queue, config.coalesce_window);
        let dispatcher = JobDispatcher::new(erp, flusher, config.clone());
        Self {
            store,
            governor,
            dispatcher,
            config,
        }
    }

    async fn fail_unsupported(&self, job_id: JobId, job_type: &str) -> Result<(), JobError> {
        let reason = format!("Unsupported job type: {}", job_type);
        match self
            .store
            .transition(job_id, JobTransition::Failed { error: reason })
            .await
        {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) | Err(StorageError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn process(&self, delivery: &Delivery, message: &JobMessage) -> Result<Disposition, JobError> {
        let started = Instant::now();
        let job_id = message.job_id;

        match self
            .store
            .transition(
                job_id,
                JobTransition::Processing {
                    attempt: delivery.delivery_count,
                },
            )
            .await
        {
            Ok(_) => {}
            Err(StorageError::InvalidTransition { from, .. }) => {
                info!(%job_id, status = %from, "job already settled, acknowledging delivery");
                return Ok(Disposition::Complete);
            }
            Err(StorageError::NotFound(_)) => {
                warn!(%job_id, "job record missing, dropping message");
                return Ok(Disposition::Complete);
            }
            Err(e) => return Err(e.into()),
        }

        let permit = self.governor.acquire(&message.vendor_id).await?;
        let outcome = self.dispatcher.dispatch(message).await;
        let throttle_wait_ms = permit.waits.longest().as_millis() as u64;
        drop(permit);

        let error = match outcome {
            Ok(result) => {
                self.store
                    .transition(job_id, JobTransition::Succeeded { result })
                    .await?;
                info!(
                    %job_id,
                    job_type = %message.job_type,
                    attempt = delivery.delivery_count,
                    throttle_wait_ms,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                return Ok(Disposition::Complete);
            }
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => e,
        };

        if error.is_transient() && delivery.delivery_count < self.config.max_deliveries {
            self.store
                .transition(
                    job_id,
                    JobTransition::Requeued {
                        error: error.to_string(),
                    },
                )
                .await?;
            let delay = self.config.redelivery.delay_for_attempt(delivery.delivery_count);
            warn!(
                %job_id,
                job_type = %message.job_type,
                attempt = delivery.delivery_count,
                max_deliveries = self.config.max_deliveries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job requeued after transient failure"
            );
            return Ok(Disposition::Abandon { delay: Some(delay) });
        }

        // A failed flusher hands its buffer back so the next edit schedules anew
        match message.opportunity_id.as_deref() {
            Some(entity_id) if message.job_type.is_update() => {
                self.store
                    .fail_scheduled_update(job_id, entity_id, &error.to_string())
                    .await?;
            }
            _ => {
                self.store
                    .transition(
                        job_id,
                        JobTransition::Failed {
                            error: error.to_string(),
                        },
                    )
                    .await?;
            }
        }

        error!(
            %job_id,
            job_type = %message.job_type,
            attempt = delivery.delivery_count,
            category = error.category().code(),
            transient = error.is_transient(),
            duration_ms = started.elapsed().as_millis() as u64,
            error = %error,
            "job failed"
        );
        Ok(Disposition::Complete)
    }
}

#[async_trait]
impl MessageHandler for JobProcessor {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message = match JobMessage::from_body(&delivery.body) {
            Ok(message) => message,
            Err(MessageError::Malformed(reason)) => {
                error!(message_id = %delivery.message_id, %reason, "malformed job message");
                return Disposition::Complete;
            }
            Err(MessageError::UnsupportedType { job_id, job_type }) => {
                error!(%job_id, %job_type, "unsupported job type");
                return match self.fail_unsupported(job_id, &job_type).await {
                    Ok(()) => Disposition::Complete,
                    Err(e) => {
                        error!(%job_id, error = %e, "could not record unsupported job");
                        Disposition::Abandon { delay: None }
                    }
                };
            }
        };

        info!(
            job_id = %message.job_id,
            job_type = %message.job_type,
            vendor_id = %message.vendor_id,
            delivery_count = delivery.delivery_count,
            "job received"
        );

        match self.process(delivery, &message).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(
                    job_id = %message.job_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "job processing interrupted, abandoning delivery"
                );
                Disposition::Abandon { delay: None }
            }
        }
    }
}
