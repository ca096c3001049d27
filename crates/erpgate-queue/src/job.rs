//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Upper bound on the stored error message, in characters.
pub const MAX_ERROR_LEN: usize = 4000;

/// Kinds of work accepted for the ERP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "GET_CUSTOMER")]
    GetCustomer,
    #[serde(rename = "GET_OPPORTUNITY")]
    GetOpportunity,
    #[serde(rename = "CREATE_OPPORTUNITY")]
    CreateOpportunity,
    #[serde(rename = "UPDATE_OPPORTUNITY")]
    UpdateOpportunity,
    #[serde(rename = "ERP_GET_ORDER_HEADER")]
    GetOrderHeader,
    #[serde(rename = "ERP_VERIFY_CUSTOMER")]
    VerifyCustomer,
    #[serde(rename = "ERP_GET_PAYMENT_INFO")]
    GetPaymentInfo,
    #[serde(rename = "ERP_GET_INVENTORY_DETAILS")]
    GetInventoryDetails,
    #[serde(rename = "ERP_GET_ORDER_SUMMARIES")]
    GetOrderSummaries,
    #[serde(rename = "ERP_GET_ORDER_SUMMARIES_DELTA")]
    GetOrderSummariesDelta,
    #[serde(rename = "ERP_GET_ADDRESS_CONTACT")]
    GetAddressContact,
    #[serde(rename = "ERP_GET_ORDER_LAST_MODIFIED")]
    GetOrderLastModified,
    #[serde(rename = "ERP_GET_ORDER_READY_REPORT")]
    GetOrderReadyReport,
    /// Accepted on the wire; no worker handler exists yet
    #[serde(rename = "ERP_GET_CLOSEOUT_INVENTORY_REPORT")]
    GetCloseoutInventoryReport,
}

impl JobType {
    pub const ALL: [JobType; 14] = [
        JobType::GetCustomer,
        JobType::GetOpportunity,
        JobType::CreateOpportunity,
        JobType::UpdateOpportunity,
        JobType::GetOrderHeader,
        JobType::VerifyCustomer,
        JobType::GetPaymentInfo,
        JobType::GetInventoryDetails,
        JobType::GetOrderSummaries,
        JobType::GetOrderSummariesDelta,
        JobType::GetAddressContact,
        JobType::GetOrderLastModified,
        JobType::GetOrderReadyReport,
        JobType::GetCloseoutInventoryReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::GetCustomer => "GET_CUSTOMER",
            JobType::GetOpportunity => "GET_OPPORTUNITY",
            JobType::CreateOpportunity => "CREATE_OPPORTUNITY",
            JobType::UpdateOpportunity => "UPDATE_OPPORTUNITY",
            JobType::GetOrderHeader => "ERP_GET_ORDER_HEADER",
            JobType::VerifyCustomer => "ERP_VERIFY_CUSTOMER",
            JobType::GetPaymentInfo => "ERP_GET_PAYMENT_INFO",
            JobType::GetInventoryDetails => "ERP_GET_INVENTORY_DETAILS",
            JobType::GetOrderSummaries => "ERP_GET_ORDER_SUMMARIES",
            JobType::GetOrderSummariesDelta => "ERP_GET_ORDER_SUMMARIES_DELTA",
            JobType::GetAddressContact => "ERP_GET_ADDRESS_CONTACT",
            JobType::GetOrderLastModified => "ERP_GET_ORDER_LAST_MODIFIED",
            JobType::GetOrderReadyReport => "ERP_GET_ORDER_READY_REPORT",
            JobType::GetCloseoutInventoryReport => "ERP_GET_CLOSEOUT_INVENTORY_REPORT",
        }
    }

    /// Update jobs are flushed through the per-entity coalescing buffer.
    pub fn is_update(&self) -> bool {
        matches!(self, JobType::UpdateOpportunity)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unsupported job type: {}", s))
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a consumer (also the state of a job awaiting redelivery)
    Queued,
    /// A consumer holds the message
    Processing,
    /// Upstream call finished and the result is stored
    Succeeded,
    /// Terminal failure
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Allowed edges of the job state machine.
    ///
    /// `Processing -> Processing` covers redelivery after a lost lock.
    /// `Failed -> Queued` is only taken for jobs that never reached a consumer.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: {}", other)),
        }
    }
}

/// A persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub vendor_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub entity_key: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Delivery count of the most recent processing attempt
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// New job in `queued` state with a fresh id.
    pub fn queued(
        vendor_id: &str,
        job_type: JobType,
        entity_key: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            vendor_id: vendor_id.to_string(),
            job_type,
            status: JobStatus::Queued,
            entity_key,
            payload,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Clamp an error message to `MAX_ERROR_LEN` characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
