//! Wire format of job messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::backend::{OutboundMessage, QueueBackend, QueueError};
use crate::job::{JobId, JobType};

/// Body of every message published for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: JobId,
    pub vendor_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

/// Why a received body could not be turned into a `JobMessage`.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Not attributable to any job
    #[error("Malformed message: {0}")]
    Malformed(String),
    /// Carries a job id, but the type is unknown
    #[error("Unsupported job type {job_type} for job {job_id}")]
    UnsupportedType { job_id: JobId, job_type: String },
}

impl JobMessage {
    pub fn new(job_id: JobId, vendor_id: &str, job_type: JobType) -> Self {
        Self {
            job_id,
            vendor_id: vendor_id.to_string(),
            job_type,
            customer_id: None,
            opportunity_id: None,
            idempotency_key: None,
            payload: None,
            requested_at: Utc::now(),
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

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: Option<serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Parse a received body.
    ///
    /// A body lacking `jobId`, `type` or `vendorId` is malformed. A body that
    /// names a job but an unknown type yields `UnsupportedType` so the job can
    /// be failed.
    pub fn from_body(body: &serde_json::Value) -> Result<Self, MessageError> {
        let parse_err = match serde_json::from_value::<JobMessage>(body.clone()) {
            Ok(message) => return Ok(message),
            Err(e) => e,
        };

        let field = |name: &str| body.get(name).and_then(|v| v.as_str());
        let (Some(job_id), Some(job_type), Some(_vendor)) =
            (field("jobId"), field("type"), field("vendorId"))
        else {
            return Err(MessageError::Malformed(
                "missing jobId, type or vendorId".to_string(),
            ));
        };
        let job_id = Uuid::parse_str(job_id)
            .map_err(|_| MessageError::Malformed(format!("invalid jobId: {}", job_id)))?;

        if job_type.parse::<JobType>().is_err() {
            return Err(MessageError::UnsupportedType {
                job_id,
                job_type: job_type.to_string(),
            });
        }

        Err(MessageError::Malformed(parse_err.to_string()))
    }
}

/// Publish a job message; the message id is the job id.
pub async fn publish_job<Q: QueueBackend + ?Sized>(
    queue: &Q,
    message: &JobMessage,
) -> Result<(), QueueError> {
    let started = Instant::now();
    let mut properties = BTreeMap::new();
    properties.insert("vendorId".to_string(), message.vendor_id.clone());
    properties.insert("type".to_string(), message.job_type.as_str().to_string());

    queue
        .send(OutboundMessage {
            message_id: message.job_id,
            body: serde_json::to_value(message)?,
            properties,
        })
        .await?;

    info!(
        job_id = %message.job_id,
        vendor_id = %message.vendor_id,
        job_type = %message.job_type,
        duration_ms = started.elapsed().as_millis() as u64,
        "job published"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camel_case_wire_format() {
        let id = Uuid::new_v4();
        let message = JobMessage::new(id, "specbooks", JobType::UpdateOpportunity)
            .with_opportunity("OP-1")
            .with_payload(Some(json!({"a": 1})));

        let body = serde_json::to_value(&message).unwrap();
        assert_eq!(body["jobId"], json!(id.to_string()));
        assert_eq!(body["vendorId"], json!("specbooks"));
        assert_eq!(body["type"], json!("UPDATE_OPPORTUNITY"));
        assert_eq!(body["opportunityId"], json!("OP-1"));
        assert!(body.get("customerId").is_none());

        assert_eq!(JobMessage::from_body(&body).unwrap(), message);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let err = JobMessage::from_body(&json!({"type": "GET_CUSTOMER"})).unwrap_err();
        assert!(matches!(err, MessageError::Malformed(_)));

        let err = JobMessage::from_body(&json!("not an object")).unwrap_err();
        assert!(matches!(err, MessageError::Malformed(_)));
    }

    #[test]
    fn test_unknown_type_names_the_job() {
        let id = Uuid::new_v4();
        let err = JobMessage::from_body(&json!({
            "jobId": id.to_string(),
            "vendorId": "specbooks",
            "type": "DELETE_EVERYTHING",
        }))
        .unwrap_err();

        match err {
            MessageError::UnsupportedType { job_id, job_type } => {
                assert_eq!(job_id, id);
                assert_eq!(job_type, "DELETE_EVERYTHING");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
