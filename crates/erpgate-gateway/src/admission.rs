//! Fixed-window admission control
//!
//! Counters live in the job store, keyed on `(vendor, route, window start)`,
//! so every gateway instance sharing the store shares the budget.

use chrono::{DateTime, Utc};
use erpgate_persist::JobStore;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AdmissionConfig;
use crate::error::{GatewayError, GatewayResult};

/// Usage at or above this share of the limit is logged
const NEAR_LIMIT_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// Requests counted in the current window, this one included
    pub count: u32,
    pub limit: u32,
}

#[derive(Debug)]
pub struct AdmissionLimiter {
    store: Arc<dyn JobStore>,
    config: AdmissionConfig,
}

impl AdmissionLimiter {
    pub fn new(store: Arc<dyn JobStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub async fn admit(&self, vendor_id: &str, route: &str) -> GatewayResult<Admitted> {
        self.admit_at(vendor_id, route, Utc::now()).await
    }

    /// Count one request at `now` and reject it if the window is full.
    pub async fn admit_at(
        &self,
        vendor_id: &str,
        route: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<Admitted> {
        let limit = self.config.limit_for(route);
        let window_ms = self.config.window.as_millis().max(1) as i64;
        let now_ms = now.timestamp_millis();
        let window_start = now_ms.div_euclid(window_ms) * window_ms;

        let count = self
            .store
            .increment_rate_window(vendor_id, route, window_start)
            .await?;

        let usage = f64::from(count) / f64::from(limit.max(1));
        if count > limit {
            let remaining_ms = window_start + window_ms - now_ms;
            let retry_after_secs = ((remaining_ms + 999) / 1000).max(1) as u64;
            warn!(
                vendor_id,
                route,
                count,
                limit,
                retry_after_secs,
                "admission rate limit exceeded"
            );
            return Err(GatewayError::RateLimited {
                route: route.to_string(),
                retry_after_secs,
            });
        }

        if usage >= NEAR_LIMIT_RATIO {
            info!(vendor_id, route, count, limit, "admission near rate limit");
        }
        Ok(Admitted { count, limit })
    }
}
