//! Synchronous ERP reads
//!
//! For callers that need an answer inline rather than a job id. Calls run
//! through [`UpstreamGuard::protect`], so they fail fast when the local caps
//! are full and retry transient failures before giving up.

use erpgate_upstream::{ErpClient, ErpOperation, UpstreamGuard};
use serde_json::Value;
use std::sync::Arc;

use crate::error::GatewayResult;
use crate::validation::{self, Limits};

#[derive(Debug)]
pub struct ErpProxy {
    erp: Arc<dyn ErpClient>,
    guard: UpstreamGuard,
    limits: Limits,
}

impl ErpProxy {
    pub fn new(erp: Arc<dyn ErpClient>, guard: UpstreamGuard, limits: Limits) -> Self {
        Self { erp, guard, limits }
    }

    pub fn guard(&self) -> &UpstreamGuard {
        &self.guard
    }

    pub async fn get_customer(&self, customer_id: &str) -> GatewayResult<Value> {
        let customer_id = validation::identifier("customerId", customer_id, self.limits)?;
        let erp = &self.erp;
        let value = self
            .guard
            .protect(ErpOperation::GetCustomer.as_str(), || {
                erp.get_customer(&customer_id)
            })
            .await?;
        Ok(value)
    }

    pub async fn get_opportunity(&self, opportunity_id: &str) -> GatewayResult<Value> {
        let opportunity_id =
            validation::identifier("opportunityId", opportunity_id, self.limits)?;
        let erp = &self.erp;
        let value = self
            .guard
            .protect(ErpOperation::GetOpportunity.as_str(), || {
                erp.get_opportunity(&opportunity_id)
            })
            .await?;
        Ok(value)
    }
}
