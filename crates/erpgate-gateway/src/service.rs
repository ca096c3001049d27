//! Job admission and enqueue
//!
//! Every accepted request writes a job record first and publishes its message
//! second. A failed publish leaves the job `failed` with the broker error so
//! the caller can see why nothing happened.

use chrono::{DateTime, Utc};
use erpgate_persist::{CoalesceOutcome, JobStore, JobTransition, StorageError};
use erpgate_queue::{publish_job, JobId, JobMessage, JobRecord, JobStatus, JobType, QueueBackend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::admission::AdmissionLimiter;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::validation::{self, Limits};

/// A request for a plain (non-deduplicated) job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_type: JobType,
    pub customer_id: Option<String>,
    pub opportunity_id: Option<String>,
    pub payload: Option<Value>,
}

impl EnqueueRequest {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            customer_id: None,
            opportunity_id: None,
            payload: None,
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_opportunity(mut self, opportunity_id: impl Into<String>) -> Self {
        self.opportunity_id = Some(opportunity_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn entity_key(&self) -> Option<String> {
        self.customer_id
            .clone()
            .or_else(|| self.opportunity_id.clone())
    }
}

/// Inputs of the order and report jobs. Each job type reads only its own fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderJobRequest {
    pub baid: Option<String>,
    #[serde(default)]
    pub order_nbrs: Vec<String>,
    pub order_nbr: Option<String>,
    /// Lower bound on `LastModified`, ISO timestamp or OData literal
    pub since: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub use_order_by: bool,
    pub cutoff_literal: Option<String>,
    pub chunk_size: Option<u32>,
}

impl OrderJobRequest {
    pub fn for_account(baid: impl Into<String>) -> Self {
        Self {
            baid: Some(baid.into()),
            ..Self::default()
        }
    }

    fn baid(&self, limits: Limits) -> GatewayResult<String> {
        let baid = self.baid.as_deref().unwrap_or_default();
        Ok(validation::identifier("baid", baid, limits)?.to_uppercase())
    }

    fn order_nbrs(&self, limits: Limits) -> GatewayResult<Vec<String>> {
        self.order_nbrs
            .iter()
            .map(|n| Ok(validation::identifier("orderNbrs", n, limits)?.to_uppercase()))
            .collect()
    }

    /// The normalized payload the worker reads for `job_type`.
    fn payload_for(&self, job_type: JobType, limits: Limits) -> GatewayResult<Value> {
        let page_size = |default: u32| positive("pageSize", self.page_size, default);
        let payload = match job_type {
            JobType::GetPaymentInfo | JobType::GetInventoryDetails => json!({
                "baid": self.baid(limits)?,
                "orderNbrs": self.order_nbrs(limits)?,
            }),
            JobType::GetOrderSummaries => json!({
                "baid": self.baid(limits)?,
                "pageSize": page_size(250)?,
                "maxPages": positive("maxPages", self.max_pages, 50)?,
                "useOrderBy": self.use_order_by,
            }),
            JobType::GetOrderSummariesDelta => {
                let since = self.since.as_deref().unwrap_or_default();
                json!({
                    "baid": self.baid(limits)?,
                    "since": validation::identifier("since", since, limits)?,
                    "pageSize": page_size(250)?,
                    "maxPages": positive("maxPages", self.max_pages, 50)?,
                    "useOrderBy": self.use_order_by,
                })
            }
            JobType::GetAddressContact => {
                let cutoff_literal = self
                    .cutoff_literal
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .map(|c| validation::identifier("cutoffLiteral", c, limits))
                    .transpose()?;
                json!({
                    "baid": self.baid(limits)?,
                    "orderNbrs": self.order_nbrs(limits)?,
                    "cutoffLiteral": cutoff_literal,
                    "useOrderBy": self.use_order_by,
                    "pageSize": page_size(500)?,
                    "chunkSize": positive("chunkSize", self.chunk_size, 40)?,
                })
            }
            JobType::GetOrderLastModified => {
                let order_nbr = self.order_nbr.as_deref().unwrap_or_default();
                json!({
                    "baid": self.baid(limits)?,
                    "orderNbr": validation::identifier("orderNbr", order_nbr, limits)?.to_uppercase(),
                })
            }
            JobType::GetOrderReadyReport => json!({}),
            other => {
                return Err(GatewayError::Validation(format!(
                    "{} is not an order or report job",
                    other
                )))
            }
        };
        Ok(payload)
    }
}

fn positive(field: &str, value: Option<u32>, default: u32) -> GatewayResult<u32> {
    match value {
        None => Ok(default),
        Some(0) => Err(GatewayError::Validation(format!(
            "{} must be a positive integer",
            field
        ))),
        Some(n) => Ok(n),
    }
}

/// Answer to an accepted request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub job_id: JobId,
    /// True when an existing job absorbed the request
    pub reused: bool,
    pub status: JobStatus,
}

/// Public projection of a job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub vendor_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobView {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            vendor_id: job.vendor_id,
            job_type: job.job_type,
            status: job.status,
            result: job.result,
            error: job.error,
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueBackend>,
    admission: AdmissionLimiter,
    config: GatewayConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueBackend>,
        admission: AdmissionLimiter,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            queue,
            admission,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn limits(&self) -> Limits {
        Limits::from(&self.config)
    }

    async fn admit(&self, job_type: JobType) -> GatewayResult<()> {
        self.admission
            .admit(&self.config.vendor_id, job_type.as_str())
            .await
            .map(|_| ())
    }

    // Request-level entry points: validate, admit, enqueue.

    pub async fn request_customer(&self, customer_id: &str) -> GatewayResult<Accepted> {
        let customer_id = validation::identifier("customerId", customer_id, self.limits())?;
        self.admit(JobType::GetCustomer).await?;
        self.enqueue_job(EnqueueRequest::new(JobType::GetCustomer).with_customer(customer_id))
            .await
    }

    pub async fn request_opportunity(&self, opportunity_id: &str) -> GatewayResult<Accepted> {
        let opportunity_id =
            validation::identifier("opportunityId", opportunity_id, self.limits())?;
        self.admit(JobType::GetOpportunity).await?;
        self.enqueue_job(
            EnqueueRequest::new(JobType::GetOpportunity).with_opportunity(opportunity_id),
        )
        .await
    }

    /// Create an opportunity; with a key, at most one job is ever created for it.
    pub async fn request_create(
        &self,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<Accepted> {
        validation::payload(&payload, self.limits())?;
        let key = idempotency_key
            .map(|key| validation::identifier("idempotencyKey", key, self.limits()))
            .transpose()?;
        self.admit(JobType::CreateOpportunity).await?;

        match key {
            Some(key) => self.create_with_idempotency(payload, &key).await,
            None => {
                self.enqueue_job(
                    EnqueueRequest::new(JobType::CreateOpportunity).with_payload(payload),
                )
                .await
            }
        }
    }

    pub async fn request_update(
        &self,
        opportunity_id: &str,
        payload: Value,
    ) -> GatewayResult<Accepted> {
        let opportunity_id =
            validation::identifier("opportunityId", opportunity_id, self.limits())?;
        validation::update_payload(&payload, self.limits())?;
        self.admit(JobType::UpdateOpportunity).await?;
        self.enqueue_coalesced_update(&opportunity_id, payload).await
    }

    pub async fn request_order_header(&self, order_nbr: &str) -> GatewayResult<Accepted> {
        let order_nbr = validation::identifier("orderNbr", order_nbr, self.limits())?;
        self.admit(JobType::GetOrderHeader).await?;
        self.enqueue_job(
            EnqueueRequest::new(JobType::GetOrderHeader)
                .with_payload(json!({ "orderNbr": order_nbr.to_uppercase() })),
        )
        .await
    }

    pub async fn request_customer_verification(
        &self,
        customer_id: &str,
        zip5: &str,
    ) -> GatewayResult<Accepted> {
        let customer_id = validation::identifier("customerId", customer_id, self.limits())?;
        let zip5: String = zip5.chars().filter(char::is_ascii_digit).take(5).collect();
        if zip5.len() != 5 {
            return Err(GatewayError::Validation(
                "zip5 must contain five digits".to_string(),
            ));
        }
        self.admit(JobType::VerifyCustomer).await?;
        self.enqueue_job(EnqueueRequest::new(JobType::VerifyCustomer).with_payload(json!({
            "customerId": customer_id.to_uppercase(),
            "zip5": zip5,
        })))
        .await
    }

    /// Order lookups and reports; the payload is normalized before it is queued.
    pub async fn request_order_job(
        &self,
        job_type: JobType,
        request: &OrderJobRequest,
    ) -> GatewayResult<Accepted> {
        let payload = request.payload_for(job_type, self.limits())?;
        validation::payload(&payload, self.limits())?;
        self.admit(job_type).await?;
        self.enqueue_job(EnqueueRequest::new(job_type).with_payload(payload))
            .await
    }

    // Core operations

    /// Write a fresh job and publish it.
    pub async fn enqueue_job(&self, request: EnqueueRequest) -> GatewayResult<Accepted> {
        let job = JobRecord::queued(
            &self.config.vendor_id,
            request.job_type,
            request.entity_key(),
            request.payload.clone(),
        );
        self.store.insert_job(&job).await?;

        let mut message = JobMessage::new(job.id, &job.vendor_id, job.job_type)
            .with_payload(request.payload);
        message.customer_id = request.customer_id;
        message.opportunity_id = request.opportunity_id;

        self.publish_or_fail(&message).await?;
        Ok(Accepted {
            job_id: job.id,
            reused: false,
            status: JobStatus::Queued,
        })
    }

    /// Create an opportunity job bound to `(vendor, key)`.
    ///
    /// A key that is already bound returns the existing job. A racer that
    /// loses the insert re-reads the winner. A bound job that failed before
    /// any consumer saw it is requeued and republished.
    pub async fn create_with_idempotency(
        &self,
        payload: Value,
        key: &str,
    ) -> GatewayResult<Accepted> {
        let vendor_id = &self.config.vendor_id;

        if let Some(job_id) = self.store.find_idempotent_job(vendor_id, key).await? {
            info!(vendor_id, idempotency_key = key, job_id = %job_id, "idempotency key reused");
            return self.replay(job_id, key).await;
        }

        let job = JobRecord::queued(
            vendor_id,
            JobType::CreateOpportunity,
            None,
            Some(payload.clone()),
        );
        match self.store.insert_job_with_idempotency_key(&job, key).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => {
                let winner = self
                    .store
                    .find_idempotent_job(vendor_id, key)
                    .await?
                    .ok_or_else(|| {
                        StorageError::Internal(format!("idempotency key {} vanished", key))
                    })?;
                info!(vendor_id, idempotency_key = key, job_id = %winner, "idempotency race reused");
                return self.accepted_existing(winner).await;
            }
            Err(e) => return Err(e.into()),
        }

        let message = JobMessage::new(job.id, vendor_id, JobType::CreateOpportunity)
            .with_idempotency_key(key)
            .with_payload(Some(payload));
        self.publish_or_fail(&message).await?;

        Ok(Accepted {
            job_id: job.id,
            reused: false,
            status: JobStatus::Queued,
        })
    }

    async fn replay(&self, job_id: JobId, key: &str) -> GatewayResult<Accepted> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Failed || job.attempts != 0 {
            return Ok(Accepted {
                job_id,
                reused: true,
                status: job.status,
            });
        }

        // Never reached a consumer: the original publish failed.
        if !self.store.requeue_unattempted(job_id).await? {
            return self.accepted_existing(job_id).await;
        }
        warn!(job_id = %job_id, idempotency_key = key, "republishing unsent job");

        let message = JobMessage::new(job_id, &job.vendor_id, job.job_type)
            .with_idempotency_key(key)
            .with_payload(job.payload);
        self.publish_or_fail(&message).await?;

        Ok(Accepted {
            job_id,
            reused: true,
            status: JobStatus::Queued,
        })
    }

    /// Record an update for `entity_id`, merging into a pending flush if
    /// there is one.
    pub async fn enqueue_coalesced_update(
        &self,
        entity_id: &str,
        payload: Value,
    ) -> GatewayResult<Accepted> {
        let candidate = JobRecord::queued(
            &self.config.vendor_id,
            JobType::UpdateOpportunity,
            Some(entity_id.to_string()),
            Some(payload.clone()),
        );

        match self
            .store
            .coalesce_update(entity_id, payload, &candidate)
            .await?
        {
            CoalesceOutcome::Merged { job_id } => {
                info!(entity_id, job_id = %job_id, "coalesced update merged");
                self.accepted_existing(job_id).await
            }
            CoalesceOutcome::Scheduled { job_id } => {
                info!(entity_id, job_id = %job_id, "coalesced update scheduled");
                // The flusher reads the buffer; the message carries no payload
                let message =
                    JobMessage::new(job_id, &self.config.vendor_id, JobType::UpdateOpportunity)
                        .with_opportunity(entity_id);

                if let Err(e) = publish_job(self.queue.as_ref(), &message).await {
                    error!(entity_id, job_id = %job_id, error = %e, "job publish failed");
                    self.store
                        .fail_scheduled_update(job_id, entity_id, &e.to_string())
                        .await?;
                    return Err(e.into());
                }

                Ok(Accepted {
                    job_id,
                    reused: false,
                    status: JobStatus::Queued,
                })
            }
        }
    }

    pub async fn get_job(&self, job_id: JobId) -> GatewayResult<JobView> {
        self.store
            .get_job(job_id)
            .await?
            .map(JobView::from)
            .ok_or(GatewayError::NotFound(job_id))
    }

    async fn load(&self, job_id: JobId) -> GatewayResult<JobRecord> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(job_id.to_string()).into())
    }

    async fn accepted_existing(&self, job_id: JobId) -> GatewayResult<Accepted> {
        let job = self.load(job_id).await?;
        Ok(Accepted {
            job_id,
            reused: true,
            status: job.status,
        })
    }

    /// Publish; on failure record it on the job and return the broker error.
    async fn publish_or_fail(&self, message: &JobMessage) -> GatewayResult<()> {
        let Err(e) = publish_job(self.queue.as_ref(), message).await else {
            return Ok(());
        };

        error!(
            job_id = %message.job_id,
            job_type = %message.job_type,
            error = %e,
            "job publish failed"
        );
        if let Err(store_err) = self
            .store
            .transition(
                message.job_id,
                JobTransition::Failed {
                    error: e.to_string(),
                },
            )
            .await
        {
            error!(job_id = %message.job_id, error = %store_err, "could not record publish failure");
        }
        Err(e.into())
    }
}
