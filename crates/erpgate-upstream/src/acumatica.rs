//! Acumatica contract-based REST client

use async_trait::async_trait;
use chrono::{DateTime, Months, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::{AddressContactQuery, ErpClient, OrderQuery, SummaryQuery};
use crate::config::{env_millis, env_required, env_string, ConfigError};
use crate::error::UpstreamError;

/// Tokens are refreshed this long before they actually expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Row cap for order lookups keyed by order number
const ORDER_LOOKUP_TOP: u32 = 500;

const SUMMARY_SELECT: &str =
    "OrderNbr,Status,LocationID,RequestedOn,ShipVia,JobName,CustomerName,DefaultSalesperson,NoteID";
const SUMMARY_CUSTOM: &str = "Document.AttributeBUYERGROUP";

/// Statuses hidden from the open-order summary listing
const SUMMARY_EXCLUDED_STATUSES: [&str; 13] = [
    "Canceled",
    "On Hold",
    "Pending Approval",
    "Rejected",
    "Pending Processing",
    "Awaiting Payment",
    "Credit Hold",
    "Completed",
    "Invoiced",
    "Expired",
    "Purchase Hold",
    "Not Approved",
    "Risk Hold",
];

/// Ship-via codes that are not will-call pickups
const SUMMARY_EXCLUDED_SHIP_VIA: [&str; 26] = [
    "DELIVERY SLC",
    "DELIVERY SW",
    "DIRECT SHIP",
    "GROUND",
    "MLD DROP SHIP",
    "NEXT DAY AIR",
    "RED LABEL",
    "2ND DAY AIR",
    "3RD DAY AIR",
    "COMMON CARRIER",
    "BEST WAY",
    "DEL ST GEORGE",
    "DELIVERY",
    "DELIVERY BOISE",
    "DELIVERY PROVO",
    "DELIVERY JACKSO",
    "DELIVERY KETCHU",
    "DELIVERY LAYTON",
    "DELIVERY PLUMBI",
    "RUSH",
    "TRANS BOISE",
    "TRANS JACKSON",
    "TRANS PROVO",
    "TRANS SLC",
    "WAIVER PROVO",
    "WAIVER SLC",
];

const INVENTORY_BLOCKED_STATUSES: [&str; 13] = [
    "Canceled",
    "Cancelled",
    "On Hold",
    "Pending Approval",
    "Rejected",
    "Pending Processing",
    "Credit Hold",
    "Completed",
    "Invoiced",
    "Expired",
    "Purchase Hold",
    "Not Approved",
    "Risk Hold",
];

const INVENTORY_SELECT: &str = "OrderNbr,Details/InventoryID,Details/LineDescription,\
Details/LineType,Details/UnitPrice,Details/OpenQty,Details/OrderQty,Details/Amount,\
Details/UsrETA,Details/Here,Details/Allocations/Allocated,Details/Allocations/Qty,\
Details/WarehouseID,Details/TaxZone";

const ADDRESS_CONTACT_SELECT: &str =
    "OrderNbr,AddressLine1,AddressLine2,City,State,PostalCode,DeliveryEmail,JobName,ShipVia";
const ADDRESS_CONTACT_CUSTOM: &str = "Document.AttributeSITENUMBER, Document.AttributeOSCONTACT, \
Document.AttributeCONFIRMVIA, Document.AttributeCONFIRMWTH";

#[derive(Debug, Clone)]
pub struct AcumaticaConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub endpoint_name: String,
    pub endpoint_version: String,
    pub customer_entity: String,
    pub opportunity_entity: String,
    pub opportunity_expand: String,
    pub order_entity: String,
    /// OData feed behind the ready-for-will-call report (basic auth)
    pub order_ready_url: String,
    pub connect_timeout: Duration,
}

impl AcumaticaConfig {
    pub fn new(base_url: &str, client_id: &str, client_secret: &str, username: &str, password: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            order_ready_url: format!("{}/OData/Ready%20for%20Willcall", base_url),
            base_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            endpoint_name: "Default".to_string(),
            endpoint_version: "24.200.001".to_string(),
            customer_entity: "Customer".to_string(),
            opportunity_entity: "Opportunity".to_string(),
            opportunity_expand: "Details".to_string(),
            order_entity: "SalesOrder".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Load from `ACUMATICA_*` environment variables. Credentials are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            &env_required("ACUMATICA_BASE_URL")?,
            &env_required("ACUMATICA_CLIENT_ID")?,
            &env_required("ACUMATICA_CLIENT_SECRET")?,
            &env_required("ACUMATICA_USERNAME")?,
            &env_required("ACUMATICA_PASSWORD")?,
        );
        config.endpoint_name = env_string("ACUMATICA_ENDPOINT_NAME", &config.endpoint_name);
        config.endpoint_version = env_string("ACUMATICA_ENDPOINT_VERSION", &config.endpoint_version);
        config.customer_entity = env_string("ACUMATICA_CUSTOMER_ENTITY", &config.customer_entity);
        config.opportunity_entity = env_string("ACUMATICA_OPPORTUNITY_ENTITY", &config.opportunity_entity);
        config.opportunity_expand = env_string("ACUMATICA_OPPORTUNITY_EXPAND", &config.opportunity_expand);
        config.order_entity = env_string("ACUMATICA_ORDER_ENTITY", &config.order_entity);
        config.order_ready_url = env_string("ACUMATICA_ORDER_READY_ODATA_URL", &config.order_ready_url);
        config.connect_timeout = env_millis("ACUMATICA_CONNECT_TIMEOUT_MS", 10_000)?;
        Ok(config)
    }

    pub fn entity_url(&self, entity: &str) -> String {
        format!(
            "{}/entity/{}/{}/{}",
            self.base_url, self.endpoint_name, self.endpoint_version, entity
        )
    }

    pub fn token_url(&self) -> String {
        format!("{}/identity/connect/token", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_MARGIN < self.expires_at
    }
}

/// Quote a value for an OData string literal.
fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Collection responses come back either as a bare array or as `{ value: [...] }`.
fn into_rows(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Transport(format!("request timed out: {}", err))
    } else if err.is_connect() {
        UpstreamError::Transport(format!("connect error: {}", err))
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

/// OAuth-authenticated client for the Acumatica REST API.
///
/// The bearer token is cached and reused until shortly before `expires_in`
/// elapses; a refresh token, when issued, is preferred over re-sending the
/// password. A 401 drops the cached token so the next call re-authenticates.
#[derive(Debug)]
pub struct AcumaticaClient {
    config: AcumaticaConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl AcumaticaClient {
    pub fn new(config: AcumaticaConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AcumaticaConfig {
        &self.config
    }

    async fn access_token(&self) -> Result<String, UpstreamError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let refresh = cached.as_ref().and_then(|t| t.refresh_token.clone());
        let issued = match refresh {
            Some(refresh_token) => match self.request_token(Some(&refresh_token)).await {
                Ok(token) => token,
                Err(err) => {
                    warn!(error = %err, "refresh grant rejected, falling back to password grant");
                    self.request_token(None).await?
                }
            },
            None => self.request_token(None).await?,
        };

        let access_token = issued.access_token.clone();
        *cached = Some(issued);
        Ok(access_token)
    }

    async fn request_token(&self, refresh_token: Option<&str>) -> Result<CachedToken, UpstreamError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        match refresh_token {
            Some(token) => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", token));
            }
            None => {
                form.push(("grant_type", "password"));
                form.push(("username", self.config.username.as_str()));
                form.push(("password", self.config.password.as_str()));
                form.push(("scope", "api offline_access"));
            }
        }

        let response = self
            .http
            .post(self.config.token_url())
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error.or(e.error_description))
                .unwrap_or_else(|| "unknown".to_string());
            if status.is_server_error() {
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(UpstreamError::Credential(format!(
                "token request failed ({}): {}",
                status.as_u16(),
                reason
            )));
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        debug!(expires_in = token.expires_in, "acumatica token issued");
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, UpstreamError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
        }
        read_json(response).await
    }

    async fn query(&self, entity: &str, params: &[(&str, String)]) -> Result<Value, UpstreamError> {
        let request = self.http.get(self.config.entity_url(entity)).query(params);
        self.send(request).await
    }

    async fn put(&self, entity: &str, body: &Value) -> Result<Value, UpstreamError> {
        let request = self.http.put(self.config.entity_url(entity)).json(body);
        self.send(request).await
    }

    async fn order_rows(&self, params: &[(&str, String)]) -> Result<Vec<Value>, UpstreamError> {
        Ok(into_rows(self.query(&self.config.order_entity, params).await?))
    }

    /// Walk `$top`/`$skip` pages until a short page or `max_pages`.
    async fn paged_order_rows(
        &self,
        params: Vec<(&str, String)>,
        page_size: u32,
        max_pages: u32,
    ) -> Result<Vec<Value>, UpstreamError> {
        let page_size = page_size.max(1);
        let mut all = Vec::new();
        for page in 0..max_pages {
            let mut page_params = params.clone();
            page_params.push(("$top", page_size.to_string()));
            page_params.push(("$skip", (page as u64 * page_size as u64).to_string()));

            let rows = self.order_rows(&page_params).await?;
            let short = rows.len() < page_size as usize;
            all.extend(rows);
            if short {
                break;
            }
        }
        debug!(rows = all.len(), "order pages fetched");
        Ok(all)
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, UpstreamError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    serde_json::from_str(&body).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
}

fn customer_clause(baid: &str) -> String {
    format!("CustomerID eq '{}'", odata_quote(baid))
}

/// `(OrderNbr eq 'A' or OrderNbr eq 'B')`
fn order_nbr_clause(order_nbrs: &[String]) -> String {
    let ors: Vec<String> = order_nbrs
        .iter()
        .map(|n| format!("OrderNbr eq '{}'", odata_quote(n)))
        .collect();
    format!("({})", ors.join(" or "))
}

fn payment_info_filter(query: &OrderQuery) -> String {
    format!(
        "{} and {}",
        customer_clause(&query.baid),
        order_nbr_clause(&query.order_nbrs)
    )
}

fn inventory_details_filter(query: &OrderQuery) -> String {
    let mut parts = vec![
        customer_clause(&query.baid),
        order_nbr_clause(&query.order_nbrs),
    ];
    parts.extend(
        INVENTORY_BLOCKED_STATUSES
            .iter()
            .map(|s| format!("Status ne '{}'", s)),
    );
    parts.push("Status ne ''".to_string());
    parts.join(" and ")
}

/// Open will-call orders requested on or after `cutoff`.
fn summaries_filter(baid: &str, cutoff: DateTime<Utc>) -> String {
    let mut parts = vec![
        customer_clause(baid),
        format!(
            "RequestedOn ge datetimeoffset'{}'",
            cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
    ];
    parts.extend(
        SUMMARY_EXCLUDED_STATUSES
            .iter()
            .map(|s| format!("Status ne '{}'", s)),
    );
    parts.extend(
        SUMMARY_EXCLUDED_SHIP_VIA
            .iter()
            .map(|v| format!("ShipVia ne '{}'", v)),
    );
    parts.join(" and ")
}

/// Wrap a bare timestamp as a `datetimeoffset'...'` literal; literals pass through.
fn since_literal(since: &str) -> String {
    if since.starts_with("datetimeoffset'") {
        since.to_string()
    } else {
        format!("datetimeoffset'{}'", since)
    }
}

fn delta_filter(baid: &str, since: &str) -> String {
    format!(
        "{} and LastModified ge {}",
        customer_clause(baid),
        since_literal(since)
    )
}

fn address_contact_filter(query: &AddressContactQuery) -> String {
    let mut parts = vec![customer_clause(&query.baid)];
    if let Some(cutoff) = query.cutoff_literal.as_deref().filter(|c| !c.is_empty()) {
        parts.push(format!("RequestedOn ge {}", cutoff));
    }
    if !query.order_nbrs.is_empty() {
        parts.push(order_nbr_clause(&query.order_nbrs));
    }
    parts.join(" and ")
}

/// `LastModified` comes back wrapped (`{ value }`) or bare, in either casing.
fn last_modified_of(row: &Value) -> Option<String> {
    ["LastModified", "lastModified"]
        .iter()
        .filter_map(|key| row.get(*key))
        .find_map(|field| match field {
            Value::Object(wrapped) => wrapped.get("value").and_then(Value::as_str),
            Value::String(raw) => Some(raw.as_str()),
            _ => None,
        })
        .map(str::to_string)
}

#[async_trait]
impl ErpClient for AcumaticaClient {
    fn name(&self) -> &str {
        "acumatica"
    }

    async fn get_customer(&self, customer_id: &str) -> Result<Value, UpstreamError> {
        let filter = format!("CustomerID eq '{}'", odata_quote(customer_id));
        self.query(&self.config.customer_entity, &[("$filter", filter)])
            .await
    }

    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Value, UpstreamError> {
        let mut params = vec![(
            "$filter",
            format!("OpportunityID eq '{}'", odata_quote(opportunity_id)),
        )];
        let expand = self.config.opportunity_expand.trim();
        if !expand.is_empty() {
            params.push(("$expand", expand.to_string()));
        }
        self.query(&self.config.opportunity_entity, &params).await
    }

    async fn create_opportunity(&self, payload: &Value) -> Result<Value, UpstreamError> {
        self.put(&self.config.opportunity_entity, payload).await
    }

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        self.put(
            &self.config.opportunity_entity,
            &with_opportunity_id(opportunity_id, payload),
        )
        .await
    }

    async fn get_order_header(&self, order_nbr: &str) -> Result<Option<Value>, UpstreamError> {
        let params = [
            ("$filter", format!("OrderNbr eq '{}'", odata_quote(order_nbr))),
            (
                "$select",
                "OrderNbr,Status,LocationID,ShipVia,CustomerID,LastModified".to_string(),
            ),
            ("$top", "1".to_string()),
        ];
        let rows = into_rows(self.query(&self.config.order_entity, &params).await?);
        Ok(rows.into_iter().next())
    }

    async fn verify_customer(&self, customer_id: &str, zip5: &str) -> Result<bool, UpstreamError> {
        let params = [
            (
                "$filter",
                format!(
                    "CustomerID eq '{}' and Zip5 eq '{}'",
                    odata_quote(customer_id),
                    odata_quote(zip5)
                ),
            ),
            ("$top", "1".to_string()),
        ];
        let rows = into_rows(self.query(&self.config.customer_entity, &params).await?);
        Ok(!rows.is_empty())
    }

    async fn get_payment_info(&self, query: &OrderQuery) -> Result<Vec<Value>, UpstreamError> {
        if query.order_nbrs.is_empty() {
            return Ok(Vec::new());
        }
        self.order_rows(&[
            ("$filter", payment_info_filter(query)),
            ("$select", "OrderNbr,OrderTotal,UnpaidBalance,Terms,Status".to_string()),
            ("$top", ORDER_LOOKUP_TOP.to_string()),
        ])
        .await
    }

    async fn get_inventory_details(
        &self,
        query: &OrderQuery,
    ) -> Result<Vec<Value>, UpstreamError> {
        if query.order_nbrs.is_empty() {
            return Ok(Vec::new());
        }
        self.order_rows(&[
            ("$filter", inventory_details_filter(query)),
            ("$select", INVENTORY_SELECT.to_string()),
            ("$expand", "Details,Details/Allocations".to_string()),
            ("$top", ORDER_LOOKUP_TOP.to_string()),
        ])
        .await
    }

    async fn get_order_summaries(&self, query: &SummaryQuery) -> Result<Vec<Value>, UpstreamError> {
        let now = Utc::now();
        let cutoff = now.checked_sub_months(Months::new(12)).unwrap_or(now);
        let mut params = vec![
            ("$filter", summaries_filter(&query.baid, cutoff)),
            ("$select", SUMMARY_SELECT.to_string()),
            ("$custom", SUMMARY_CUSTOM.to_string()),
        ];
        if query.use_order_by {
            params.push(("$orderby", "RequestedOn desc".to_string()));
        }
        self.paged_order_rows(params, query.page_size, query.max_pages)
            .await
    }

    async fn get_order_summaries_delta(
        &self,
        query: &SummaryQuery,
        since: &str,
    ) -> Result<Vec<Value>, UpstreamError> {
        let mut params = vec![
            ("$filter", delta_filter(&query.baid, since)),
            ("$select", format!("{},LastModified", SUMMARY_SELECT)),
            ("$custom", SUMMARY_CUSTOM.to_string()),
        ];
        if query.use_order_by {
            params.push(("$orderby", "LastModified desc".to_string()));
        }
        self.paged_order_rows(params, query.page_size, query.max_pages)
            .await
    }

    async fn get_address_contacts(
        &self,
        query: &AddressContactQuery,
    ) -> Result<Vec<Value>, UpstreamError> {
        let mut params = vec![
            ("$filter", address_contact_filter(query)),
            ("$select", ADDRESS_CONTACT_SELECT.to_string()),
            ("$custom", ADDRESS_CONTACT_CUSTOM.to_string()),
        ];
        if query.use_order_by {
            params.push(("$orderby", "OrderNbr desc".to_string()));
        }
        params.push(("$top", query.page_size.max(1).to_string()));
        self.order_rows(&params).await
    }

    async fn get_order_last_modified(
        &self,
        baid: &str,
        order_nbr: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let rows = self
            .order_rows(&[
                (
                    "$filter",
                    format!(
                        "OrderNbr eq '{}' and {}",
                        odata_quote(order_nbr),
                        customer_clause(baid)
                    ),
                ),
                ("$select", "OrderNbr,LastModified".to_string()),
                ("$top", "1".to_string()),
            ])
            .await?;
        Ok(rows.first().and_then(last_modified_of))
    }

    async fn get_order_ready_report(&self) -> Result<Vec<Value>, UpstreamError> {
        let response = self
            .http
            .get(&self.config.order_ready_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        Ok(into_rows(read_json(response).await?))
    }
}

/// Update body: the entity key first, caller fields layered on top.
fn with_opportunity_id(opportunity_id: &str, payload: &Value) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(
        "OpportunityID".to_string(),
        serde_json::json!({ "value": opportunity_id }),
    );
    if let Value::Object(fields) = payload {
        for (key, value) in fields {
            body.insert(key.clone(), value.clone());
        }
    }
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> AcumaticaConfig {
        AcumaticaConfig::new("https://erp.example.com/", "id", "secret", "user", "pass")
    }

    #[test]
    fn test_urls() {
        let config = config();
        assert_eq!(
            config.entity_url("Customer"),
            "https://erp.example.com/entity/Default/24.200.001/Customer"
        );
        assert_eq!(
            config.token_url(),
            "https://erp.example.com/identity/connect/token"
        );
    }

    #[test]
    fn test_odata_quote_doubles_apostrophes() {
        assert_eq!(odata_quote("O'Brien"), "O''Brien");
    }

    #[test]
    fn test_into_rows_shapes() {
        assert_eq!(into_rows(json!([{"a": 1}])).len(), 1);
        assert_eq!(into_rows(json!({"value": [{"a": 1}, {"a": 2}]})).len(), 2);
        assert!(into_rows(json!({"unexpected": true})).is_empty());
        assert!(into_rows(Value::Null).is_empty());
    }

    fn nbrs(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_order_ready_url_defaults_under_base() {
        assert_eq!(
            config().order_ready_url,
            "https://erp.example.com/OData/Ready%20for%20Willcall"
        );
    }

    #[test]
    fn test_payment_info_filter_ors_order_numbers() {
        let query = OrderQuery {
            baid: "B'1".into(),
            order_nbrs: nbrs(&["SO1", "SO2"]),
        };
        assert_eq!(
            payment_info_filter(&query),
            "CustomerID eq 'B''1' and (OrderNbr eq 'SO1' or OrderNbr eq 'SO2')"
        );
    }

    #[test]
    fn test_inventory_filter_blocks_closed_statuses() {
        let query = OrderQuery {
            baid: "B1".into(),
            order_nbrs: nbrs(&["SO1"]),
        };
        let filter = inventory_details_filter(&query);
        assert!(filter.starts_with("CustomerID eq 'B1' and (OrderNbr eq 'SO1') and "));
        assert!(filter.contains("Status ne 'Cancelled'"));
        assert!(filter.contains("Status ne 'Risk Hold'"));
        assert!(filter.ends_with("Status ne ''"));
    }

    #[test]
    fn test_summaries_filter_cutoff_and_exclusions() {
        let cutoff = DateTime::parse_from_rfc3339("2025-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let filter = summaries_filter("B1", cutoff);
        assert!(filter.starts_with(
            "CustomerID eq 'B1' and RequestedOn ge datetimeoffset'2025-03-04T05:06:07.000Z'"
        ));
        assert!(filter.contains("Status ne 'Awaiting Payment'"));
        assert!(filter.contains("ShipVia ne 'WAIVER SLC'"));
        assert_eq!(filter.matches("ShipVia ne").count(), SUMMARY_EXCLUDED_SHIP_VIA.len());
    }

    #[test]
    fn test_delta_since_literal() {
        assert_eq!(
            delta_filter("B1", "2025-01-01T00:00:00Z"),
            "CustomerID eq 'B1' and LastModified ge datetimeoffset'2025-01-01T00:00:00Z'"
        );
        assert_eq!(
            since_literal("datetimeoffset'2025-01-01T00:00:00Z'"),
            "datetimeoffset'2025-01-01T00:00:00Z'"
        );
    }

    #[test]
    fn test_address_contact_filter_optional_parts() {
        let mut query = AddressContactQuery::new("B1");
        assert_eq!(address_contact_filter(&query), "CustomerID eq 'B1'");

        query.cutoff_literal = Some("datetimeoffset'2025-01-01'".into());
        query.order_nbrs = nbrs(&["SO9"]);
        assert_eq!(
            address_contact_filter(&query),
            "CustomerID eq 'B1' and RequestedOn ge datetimeoffset'2025-01-01' and (OrderNbr eq 'SO9')"
        );
    }

    #[test]
    fn test_last_modified_shapes() {
        assert_eq!(
            last_modified_of(&json!({"LastModified": {"value": "2025-01-01"}})).as_deref(),
            Some("2025-01-01")
        );
        assert_eq!(
            last_modified_of(&json!({"lastModified": "2025-02-02"})).as_deref(),
            Some("2025-02-02")
        );
        assert_eq!(last_modified_of(&json!({"OrderNbr": "SO1"})), None);
    }

    #[test]
    fn test_update_body_carries_id() {
        let body = with_opportunity_id("OP001", &json!({"Subject": {"value": "x"}}));
        assert_eq!(body["OpportunityID"]["value"], "OP001");
        assert_eq!(body["Subject"]["value"], "x");
    }

    #[test]
    fn test_token_freshness_margin() {
        let stale = CachedToken {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Instant::now() + Duration::from_secs(10),
        };
        assert!(!stale.is_fresh());

        let fresh = CachedToken {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        assert!(fresh.is_fresh());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let client = AcumaticaClient::new(AcumaticaConfig::new(
            "http://127.0.0.1:9",
            "id",
            "secret",
            "user",
            "pass",
        ))
        .unwrap();
        let err = client.get_customer("C001").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
