//! Job type to ERP operation mapping

use erpgate_queue::{JobMessage, JobType};
use erpgate_upstream::{
    with_timeout, AddressContactQuery, ErpClient, ErpOperation, OrderQuery, SummaryQuery,
    UpstreamError,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

use crate::coalesce::UpdateFlusher;
use crate::config::ProcessorConfig;
use crate::error::JobError;

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, JobError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| JobError::Invalid(format!("{} is required", field)))
}

/// String field of the message payload, empty when absent
fn payload_str<'a>(message: &'a JobMessage, field: &str) -> &'a str {
    message
        .payload
        .as_ref()
        .and_then(|p| p.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn payload_field<'a>(message: &'a JobMessage, field: &str) -> Option<&'a Value> {
    message
        .payload
        .as_ref()
        .and_then(|p| p.get(field))
        .filter(|v| !v.is_null())
}

/// Positive integer field, `default` when absent or not a positive number
fn payload_u32(message: &JobMessage, field: &str, default: u32) -> u32 {
    let parsed = match payload_field(message, field) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

fn payload_flag(message: &JobMessage, field: &str) -> bool {
    payload_field(message, field)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// `orderNbrs` array, normalized with blanks dropped
fn payload_order_nbrs(message: &JobMessage) -> Vec<String> {
    let Some(Value::Array(items)) = payload_field(message, "orderNbrs") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(normalize_order_nbr(s)),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|n| !n.is_empty())
        .collect()
}

fn required_baid(message: &JobMessage) -> Result<String, JobError> {
    let baid = normalize_baid(payload_str(message, "baid"));
    if baid.is_empty() {
        return Err(JobError::Invalid("baid is required".to_string()));
    }
    Ok(baid)
}

fn summary_query(message: &JobMessage, baid: String) -> SummaryQuery {
    let defaults = SummaryQuery::new(baid);
    SummaryQuery {
        page_size: payload_u32(message, "pageSize", defaults.page_size),
        max_pages: payload_u32(message, "maxPages", defaults.max_pages),
        use_order_by: payload_flag(message, "useOrderBy"),
        ..defaults
    }
}

/// Buyer account ids are matched upper-case.
pub fn normalize_baid(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Strip everything but digits and keep the first five.
pub fn normalize_zip5(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).take(5).collect()
}

pub fn normalize_order_nbr(raw: &str) -> String {
    raw.trim().to_uppercase()
}

pub struct JobDispatcher {
    erp: Arc<dyn ErpClient>,
    flusher: UpdateFlusher,
    config: ProcessorConfig,
}

impl JobDispatcher {
    pub fn new(erp: Arc<dyn ErpClient>, flusher: UpdateFlusher, config: ProcessorConfig) -> Self {
        Self {
            erp,
            flusher,
            config,
        }
    }

    async fn call<T, Fut>(&self, operation: ErpOperation, fut: Fut) -> Result<T, UpstreamError>
    where
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        with_timeout(operation.as_str(), self.config.timeout_for(operation), fut).await
    }

    /// Run the upstream operation for `message` and build its job result.
    pub async fn dispatch(&self, message: &JobMessage) -> Result<Value, JobError> {
        let erp = self.erp.as_ref();
        match message.job_type {
            JobType::GetCustomer => {
                let customer_id = required(&message.customer_id, "customerId")?;
                Ok(self
                    .call(ErpOperation::GetCustomer, erp.get_customer(customer_id))
                    .await?)
            }
            JobType::GetOpportunity => {
                let opportunity_id = required(&message.opportunity_id, "opportunityId")?;
                Ok(self
                    .call(ErpOperation::GetOpportunity, erp.get_opportunity(opportunity_id))
                    .await?)
            }
            JobType::CreateOpportunity => {
                let payload = message
                    .payload
                    .as_ref()
                    .ok_or_else(|| JobError::Invalid("payload is required".to_string()))?;
                Ok(self
                    .call(ErpOperation::CreateOpportunity, erp.create_opportunity(payload))
                    .await?)
            }
            JobType::UpdateOpportunity => {
                let opportunity_id = required(&message.opportunity_id, "opportunityId")?;
                self.flusher
                    .flush(message, opportunity_id, |payload| async move {
                        self.call(
                            ErpOperation::UpdateOpportunity,
                            erp.update_opportunity(opportunity_id, &payload),
                        )
                        .await
                    })
                    .await
            }
            JobType::GetOrderHeader => {
                let order_nbr = normalize_order_nbr(payload_str(message, "orderNbr"));
                if order_nbr.is_empty() {
                    return Err(JobError::Invalid("orderNbr is required".to_string()));
                }
                let row = self
                    .call(ErpOperation::GetOrderHeader, erp.get_order_header(&order_nbr))
                    .await?;
                Ok(json!({ "found": row.is_some(), "row": row }))
            }
            JobType::VerifyCustomer => {
                let customer_id = payload_str(message, "customerId").trim().to_uppercase();
                let zip5 = normalize_zip5(payload_str(message, "zip5"));
                if customer_id.is_empty() || zip5.len() != 5 {
                    return Err(JobError::Invalid(
                        "customerId and zip5 are required".to_string(),
                    ));
                }
                let matched = self
                    .call(
                        ErpOperation::VerifyCustomer,
                        erp.verify_customer(&customer_id, &zip5),
                    )
                    .await?;
                Ok(json!({ "ok": true, "matched": matched }))
            }
            JobType::GetPaymentInfo => {
                let query = OrderQuery {
                    baid: required_baid(message)?,
                    order_nbrs: payload_order_nbrs(message),
                };
                let rows = self
                    .call(ErpOperation::GetPaymentInfo, erp.get_payment_info(&query))
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetInventoryDetails => {
                let query = OrderQuery {
                    baid: required_baid(message)?,
                    order_nbrs: payload_order_nbrs(message),
                };
                let rows = self
                    .call(
                        ErpOperation::GetInventoryDetails,
                        erp.get_inventory_details(&query),
                    )
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetOrderSummaries => {
                let query = summary_query(message, required_baid(message)?);
                let rows = self
                    .call(ErpOperation::GetOrderSummaries, erp.get_order_summaries(&query))
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetOrderSummariesDelta => {
                let baid = normalize_baid(payload_str(message, "baid"));
                let since = payload_str(message, "since").trim();
                if baid.is_empty() || since.is_empty() {
                    return Err(JobError::Invalid(
                        "baid and since are required".to_string(),
                    ));
                }
                let query = summary_query(message, baid);
                let rows = self
                    .call(
                        ErpOperation::GetOrderSummariesDelta,
                        erp.get_order_summaries_delta(&query, since),
                    )
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetAddressContact => {
                let defaults = AddressContactQuery::new(required_baid(message)?);
                let query = AddressContactQuery {
                    order_nbrs: payload_order_nbrs(message),
                    cutoff_literal: payload_field(message, "cutoffLiteral")
                        .and_then(Value::as_str)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string),
                    use_order_by: payload_flag(message, "useOrderBy"),
                    page_size: payload_u32(message, "pageSize", defaults.page_size),
                    ..defaults
                };
                let rows = self
                    .call(
                        ErpOperation::GetAddressContacts,
                        erp.get_address_contacts(&query),
                    )
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetOrderLastModified => {
                let baid = normalize_baid(payload_str(message, "baid"));
                let order_nbr = normalize_order_nbr(payload_str(message, "orderNbr"));
                if baid.is_empty() || order_nbr.is_empty() {
                    return Err(JobError::Invalid(
                        "baid and orderNbr are required".to_string(),
                    ));
                }
                let last_modified = self
                    .call(
                        ErpOperation::GetOrderLastModified,
                        erp.get_order_last_modified(&baid, &order_nbr),
                    )
                    .await?;
                Ok(json!({ "lastModified": last_modified }))
            }
            JobType::GetOrderReadyReport => {
                let rows = self
                    .call(ErpOperation::GetOrderReadyReport, erp.get_order_ready_report())
                    .await?;
                Ok(json!({ "rows": rows }))
            }
            JobType::GetCloseoutInventoryReport => Err(JobError::Invalid(format!(
                "Unsupported job type: {}",
                message.job_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip5_normalization() {
        assert_eq!(normalize_zip5("84101"), "84101");
        assert_eq!(normalize_zip5(" 84101-1234 "), "84101");
        assert_eq!(normalize_zip5("841"), "841");
        assert_eq!(normalize_zip5("abc"), "");
    }

    #[test]
    fn test_order_nbr_normalization() {
        assert_eq!(normalize_order_nbr("  so001234 "), "SO001234");
    }

    fn message(payload: Value) -> JobMessage {
        JobMessage::new(uuid::Uuid::new_v4(), "specbooks", JobType::GetOrderSummaries)
            .with_payload(Some(payload))
    }

    #[test]
    fn test_order_nbrs_are_normalized() {
        let msg = message(json!({"orderNbrs": [" so1 ", "", 42, null, "So2"]}));
        assert_eq!(payload_order_nbrs(&msg), vec!["SO1", "42", "SO2"]);
        assert!(payload_order_nbrs(&message(json!({"orderNbrs": "SO1"}))).is_empty());
    }

    #[test]
    fn test_summary_query_defaults_and_overrides() {
        let query = summary_query(&message(json!({})), "B1".into());
        assert_eq!((query.page_size, query.max_pages, query.use_order_by), (250, 50, false));

        let msg = message(json!({"pageSize": "100", "maxPages": 0, "useOrderBy": true}));
        let query = summary_query(&msg, "B1".into());
        assert_eq!((query.page_size, query.max_pages, query.use_order_by), (100, 50, true));
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required(&None, "customerId").is_err());
        assert!(required(&Some("   ".into()), "customerId").is_err());
        assert_eq!(required(&Some(" C1 ".into()), "customerId").unwrap(), "C1");
    }
}
