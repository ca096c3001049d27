//! ERP client trait

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::error::UpstreamError;

/// Named ERP operations; the name keys timeouts and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErpOperation {
    GetCustomer,
    GetOpportunity,
    CreateOpportunity,
    UpdateOpportunity,
    GetOrderHeader,
    VerifyCustomer,
    GetPaymentInfo,
    GetInventoryDetails,
    GetOrderSummaries,
    GetOrderSummariesDelta,
    GetAddressContacts,
    GetOrderLastModified,
    GetOrderReadyReport,
}

impl ErpOperation {
    pub const ALL: [ErpOperation; 13] = [
        ErpOperation::GetCustomer,
        ErpOperation::GetOpportunity,
        ErpOperation::CreateOpportunity,
        ErpOperation::UpdateOpportunity,
        ErpOperation::GetOrderHeader,
        ErpOperation::VerifyCustomer,
        ErpOperation::GetPaymentInfo,
        ErpOperation::GetInventoryDetails,
        ErpOperation::GetOrderSummaries,
        ErpOperation::GetOrderSummariesDelta,
        ErpOperation::GetAddressContacts,
        ErpOperation::GetOrderLastModified,
        ErpOperation::GetOrderReadyReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErpOperation::GetCustomer => "getCustomer",
            ErpOperation::GetOpportunity => "getOpportunity",
            ErpOperation::CreateOpportunity => "createOpportunity",
            ErpOperation::UpdateOpportunity => "updateOpportunity",
            ErpOperation::GetOrderHeader => "getOrderHeader",
            ErpOperation::VerifyCustomer => "verifyCustomer",
            ErpOperation::GetPaymentInfo => "getPaymentInfo",
            ErpOperation::GetInventoryDetails => "getInventoryDetails",
            ErpOperation::GetOrderSummaries => "getOrderSummaries",
            ErpOperation::GetOrderSummariesDelta => "getOrderSummariesDelta",
            ErpOperation::GetAddressContacts => "getAddressContacts",
            ErpOperation::GetOrderLastModified => "getOrderLastModified",
            ErpOperation::GetOrderReadyReport => "getOrderReadyReport",
        }
    }

    /// Suffix used in per-operation environment variables
    pub fn env_key(&self) -> &'static str {
        match self {
            ErpOperation::GetCustomer => "GET_CUSTOMER",
            ErpOperation::GetOpportunity => "GET_OPPORTUNITY",
            ErpOperation::CreateOpportunity => "CREATE_OPPORTUNITY",
            ErpOperation::UpdateOpportunity => "UPDATE_OPPORTUNITY",
            ErpOperation::GetOrderHeader => "ORDERS_HEADER",
            ErpOperation::VerifyCustomer => "CUSTOMERS_VERIFY",
            ErpOperation::GetPaymentInfo => "ORDERS_PAYMENT_INFO",
            ErpOperation::GetInventoryDetails => "ORDERS_INVENTORY_DETAILS",
            ErpOperation::GetOrderSummaries => "ORDERS_SUMMARIES",
            ErpOperation::GetOrderSummariesDelta => "ORDERS_SUMMARIES_DELTA",
            ErpOperation::GetAddressContacts => "ORDERS_ADDRESS_CONTACT",
            ErpOperation::GetOrderLastModified => "ORDERS_LAST_MODIFIED",
            ErpOperation::GetOrderReadyReport => "REPORT_ORDER_READY",
        }
    }
}

/// Sales orders of one buyer account, optionally narrowed to order numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderQuery {
    pub baid: String,
    pub order_nbrs: Vec<String>,
}

/// Paged sales-order summary listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryQuery {
    pub baid: String,
    pub page_size: u32,
    /// Pages fetched at most; a short page ends the listing early
    pub max_pages: u32,
    pub use_order_by: bool,
}

impl SummaryQuery {
    pub fn new(baid: impl Into<String>) -> Self {
        Self {
            baid: baid.into(),
            page_size: 250,
            max_pages: 50,
            use_order_by: false,
        }
    }
}

/// Delivery address and site contact rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressContactQuery {
    pub baid: String,
    pub order_nbrs: Vec<String>,
    /// Raw OData literal compared against `RequestedOn`
    pub cutoff_literal: Option<String>,
    pub use_order_by: bool,
    pub page_size: u32,
}

impl AddressContactQuery {
    pub fn new(baid: impl Into<String>) -> Self {
        Self {
            baid: baid.into(),
            order_nbrs: Vec::new(),
            cutoff_literal: None,
            use_order_by: false,
            page_size: 500,
        }
    }
}

impl fmt::Display for ErpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the ERP exposes. Entity bodies are opaque JSON.
#[async_trait]
pub trait ErpClient: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn get_customer(&self, customer_id: &str) -> Result<Value, UpstreamError>;

    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Value, UpstreamError>;

    async fn create_opportunity(&self, payload: &Value) -> Result<Value, UpstreamError>;

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError>;

    /// `None` when no order has that number
    async fn get_order_header(&self, order_nbr: &str) -> Result<Option<Value>, UpstreamError>;

    /// Whether the customer's primary postal code starts with `zip5`
    async fn verify_customer(&self, customer_id: &str, zip5: &str) -> Result<bool, UpstreamError>;

    /// Totals and balances; no order numbers means no rows
    async fn get_payment_info(&self, query: &OrderQuery) -> Result<Vec<Value>, UpstreamError>;

    /// Open order lines with allocations; no order numbers means no rows
    async fn get_inventory_details(&self, query: &OrderQuery)
        -> Result<Vec<Value>, UpstreamError>;

    /// Open orders requested within the last year
    async fn get_order_summaries(&self, query: &SummaryQuery) -> Result<Vec<Value>, UpstreamError>;

    /// Orders modified at or after `since` (an ISO timestamp or OData literal)
    async fn get_order_summaries_delta(
        &self,
        query: &SummaryQuery,
        since: &str,
    ) -> Result<Vec<Value>, UpstreamError>;

    async fn get_address_contacts(
        &self,
        query: &AddressContactQuery,
    ) -> Result<Vec<Value>, UpstreamError>;

    /// Raw `LastModified` of one order, `None` when the order is unknown
    async fn get_order_last_modified(
        &self,
        baid: &str,
        order_nbr: &str,
    ) -> Result<Option<String>, UpstreamError>;

    /// Rows of the ready-for-will-call report
    async fn get_order_ready_report(&self) -> Result<Vec<Value>, UpstreamError>;
}
