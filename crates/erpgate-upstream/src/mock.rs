//! Scriptable in-process ERP used by tests and local runs

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::client::{AddressContactQuery, ErpClient, ErpOperation, OrderQuery, SummaryQuery};
use crate::error::UpstreamError;

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct ErpCall {
    pub operation: ErpOperation,
    /// Entity key the call addressed, if any
    pub key: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ErpCall>,
    /// Scripted failures; `None` matches any operation
    failures: VecDeque<(Option<ErpOperation>, UpstreamError)>,
    orders: HashMap<String, Value>,
    customer_zips: HashMap<String, String>,
    report_rows: Vec<Value>,
}

impl MockState {
    /// Orders of `baid` sorted by order number, narrowed to `order_nbrs` when given.
    fn orders_of(&self, baid: &str, order_nbrs: &[String]) -> Vec<Value> {
        let mut matching: Vec<(&String, &Value)> = self
            .orders
            .iter()
            .filter(|(_, row)| field(row, "CustomerID") == Some(baid))
            .filter(|(nbr, _)| order_nbrs.is_empty() || order_nbrs.contains(*nbr))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(b.0));
        matching.into_iter().map(|(_, row)| row.clone()).collect()
    }
}

/// Field value of a canned row, wrapped (`{ value }`) or bare.
fn field<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    match row.get(key)? {
        Value::Object(wrapped) => wrapped.get("value").and_then(Value::as_str),
        Value::String(raw) => Some(raw.as_str()),
        _ => None,
    }
}

fn page_limit(query: &SummaryQuery) -> usize {
    query.page_size as usize * query.max_pages as usize
}

/// Returns canned entities, records every call and fails on demand.
#[derive(Debug, Default)]
pub struct MockErp {
    latency: Duration,
    state: Mutex<MockState>,
}

impl MockErp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn add_order(&self, order_nbr: &str, row: Value) {
        self.state
            .lock()
            .await
            .orders
            .insert(order_nbr.to_string(), row);
    }

    pub async fn add_customer_zip(&self, customer_id: &str, zip5: &str) {
        self.state
            .lock()
            .await
            .customer_zips
            .insert(customer_id.to_string(), zip5.to_string());
    }

    /// Rows returned by the ready-for-will-call report
    pub async fn set_report_rows(&self, rows: Vec<Value>) {
        self.state.lock().await.report_rows = rows;
    }

    /// Fail the next call to any operation
    pub async fn fail_next(&self, error: UpstreamError) {
        self.state.lock().await.failures.push_back((None, error));
    }

    /// Fail the next `times` calls to `operation`
    pub async fn fail_times(&self, operation: ErpOperation, times: usize, error: UpstreamError) {
        let mut state = self.state.lock().await;
        for _ in 0..times {
            state.failures.push_back((Some(operation), error.clone()));
        }
    }

    pub async fn calls(&self) -> Vec<ErpCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_for(&self, operation: ErpOperation) -> Vec<ErpCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    async fn record(
        &self,
        operation: ErpOperation,
        key: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), UpstreamError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock().await;
        state.calls.push(ErpCall {
            operation,
            key: key.map(str::to_string),
            payload: payload.cloned(),
        });

        let scripted = state
            .failures
            .iter()
            .position(|(op, _)| op.map_or(true, |op| op == operation));
        match scripted.and_then(|idx| state.failures.remove(idx)) {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ErpClient for MockErp {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_customer(&self, customer_id: &str) -> Result<Value, UpstreamError> {
        self.record(ErpOperation::GetCustomer, Some(customer_id), None)
            .await?;
        Ok(json!([{
            "CustomerID": { "value": customer_id },
            "CustomerName": { "value": format!("Customer {}", customer_id) },
        }]))
    }

    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Value, UpstreamError> {
        self.record(ErpOperation::GetOpportunity, Some(opportunity_id), None)
            .await?;
        Ok(json!([{
            "OpportunityID": { "value": opportunity_id },
            "Status": { "value": "New" },
        }]))
    }

    async fn create_opportunity(&self, payload: &Value) -> Result<Value, UpstreamError> {
        self.record(ErpOperation::CreateOpportunity, None, Some(payload))
            .await?;
        let mut created = payload.clone();
        if let Value::Object(fields) = &mut created {
            fields
                .entry("OpportunityID")
                .or_insert_with(|| json!({ "value": "OP000001" }));
        }
        Ok(created)
    }

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        self.record(
            ErpOperation::UpdateOpportunity,
            Some(opportunity_id),
            Some(payload),
        )
        .await?;
        Ok(json!({
            "OpportunityID": { "value": opportunity_id },
            "applied": payload,
        }))
    }

    async fn get_order_header(&self, order_nbr: &str) -> Result<Option<Value>, UpstreamError> {
        self.record(ErpOperation::GetOrderHeader, Some(order_nbr), None)
            .await?;
        Ok(self.state.lock().await.orders.get(order_nbr).cloned())
    }

    async fn verify_customer(&self, customer_id: &str, zip5: &str) -> Result<bool, UpstreamError> {
        self.record(
            ErpOperation::VerifyCustomer,
            Some(customer_id),
            Some(&json!({ "zip5": zip5 })),
        )
        .await?;
        let state = self.state.lock().await;
        Ok(state
            .customer_zips
            .get(customer_id)
            .is_some_and(|zip| zip == zip5))
    }

    async fn get_payment_info(&self, query: &OrderQuery) -> Result<Vec<Value>, UpstreamError> {
        self.record(ErpOperation::GetPaymentInfo, Some(query.baid.as_str()), None)
            .await?;
        if query.order_nbrs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.state.lock().await.orders_of(&query.baid, &query.order_nbrs))
    }

    async fn get_inventory_details(
        &self,
        query: &OrderQuery,
    ) -> Result<Vec<Value>, UpstreamError> {
        self.record(ErpOperation::GetInventoryDetails, Some(query.baid.as_str()), None)
            .await?;
        if query.order_nbrs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.state.lock().await.orders_of(&query.baid, &query.order_nbrs))
    }

    async fn get_order_summaries(&self, query: &SummaryQuery) -> Result<Vec<Value>, UpstreamError> {
        self.record(ErpOperation::GetOrderSummaries, Some(query.baid.as_str()), None)
            .await?;
        let mut rows = self.state.lock().await.orders_of(&query.baid, &[]);
        rows.truncate(page_limit(query));
        Ok(rows)
    }

    async fn get_order_summaries_delta(
        &self,
        query: &SummaryQuery,
        since: &str,
    ) -> Result<Vec<Value>, UpstreamError> {
        self.record(
            ErpOperation::GetOrderSummariesDelta,
            Some(query.baid.as_str()),
            Some(&json!({ "since": since })),
        )
        .await?;
        let mut rows: Vec<Value> = self
            .state
            .lock()
            .await
            .orders_of(&query.baid, &[])
            .into_iter()
            .filter(|row| field(row, "LastModified").is_some_and(|m| m >= since))
            .collect();
        rows.truncate(page_limit(query));
        Ok(rows)
    }

    async fn get_address_contacts(
        &self,
        query: &AddressContactQuery,
    ) -> Result<Vec<Value>, UpstreamError> {
        self.record(ErpOperation::GetAddressContacts, Some(query.baid.as_str()), None)
            .await?;
        let mut rows = self
            .state
            .lock()
            .await
            .orders_of(&query.baid, &query.order_nbrs);
        rows.truncate(query.page_size as usize);
        Ok(rows)
    }

    async fn get_order_last_modified(
        &self,
        baid: &str,
        order_nbr: &str,
    ) -> Result<Option<String>, UpstreamError> {
        self.record(ErpOperation::GetOrderLastModified, Some(order_nbr), None)
            .await?;
        let state = self.state.lock().await;
        Ok(state
            .orders_of(baid, &[order_nbr.to_string()])
            .first()
            .and_then(|row| field(row, "LastModified"))
            .map(str::to_string))
    }

    async fn get_order_ready_report(&self) -> Result<Vec<Value>, UpstreamError> {
        self.record(ErpOperation::GetOrderReadyReport, None, None)
            .await?;
        Ok(self.state.lock().await.report_rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_match_operation() {
        let erp = MockErp::new();
        erp.fail_times(
            ErpOperation::GetOpportunity,
            1,
            UpstreamError::Status {
                status: 503,
                body: String::new(),
            },
        )
        .await;

        // Other operations are unaffected
        assert!(erp.get_customer("C1").await.is_ok());
        assert!(erp.get_opportunity("OP1").await.is_err());
        assert!(erp.get_opportunity("OP1").await.is_ok());
        assert_eq!(erp.calls().await.len(), 3);
        assert_eq!(erp.calls_for(ErpOperation::GetOpportunity).await.len(), 2);
    }

    #[tokio::test]
    async fn test_orders_and_zips() {
        let erp = MockErp::new();
        erp.add_order("SO001", json!({"OrderNbr": {"value": "SO001"}}))
            .await;
        erp.add_customer_zip("C1", "84101").await;

        assert!(erp.get_order_header("SO001").await.unwrap().is_some());
        assert!(erp.get_order_header("SO999").await.unwrap().is_none());
        assert!(erp.verify_customer("C1", "84101").await.unwrap());
        assert!(!erp.verify_customer("C1", "90210").await.unwrap());
    }

    #[tokio::test]
    async fn test_order_queries_scope_to_customer() {
        let erp = MockErp::new();
        erp.add_order(
            "SO2",
            json!({"OrderNbr": "SO2", "CustomerID": {"value": "B1"}, "LastModified": "2025-06-01"}),
        )
        .await;
        erp.add_order(
            "SO1",
            json!({"OrderNbr": "SO1", "CustomerID": {"value": "B1"}, "LastModified": "2025-01-01"}),
        )
        .await;
        erp.add_order("SO3", json!({"OrderNbr": "SO3", "CustomerID": "B2"}))
            .await;

        let summaries = erp.get_order_summaries(&SummaryQuery::new("B1")).await.unwrap();
        let nbrs: Vec<&str> = summaries.iter().filter_map(|r| field(r, "OrderNbr")).collect();
        assert_eq!(nbrs, vec!["SO1", "SO2"]);

        let delta = erp
            .get_order_summaries_delta(&SummaryQuery::new("B1"), "2025-03-01")
            .await
            .unwrap();
        assert_eq!(delta.len(), 1);

        let none = OrderQuery {
            baid: "B1".into(),
            order_nbrs: Vec::new(),
        };
        assert!(erp.get_payment_info(&none).await.unwrap().is_empty());

        assert_eq!(
            erp.get_order_last_modified("B1", "SO2").await.unwrap().as_deref(),
            Some("2025-06-01")
        );
        assert_eq!(erp.get_order_last_modified("B1", "SO3").await.unwrap(), None);
    }
}
