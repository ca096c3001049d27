//! Gateway configuration

use erpgate_queue::JobType;
use erpgate_upstream::config::{env_or, env_string, ConfigError};
use std::collections::HashMap;
use std::time::Duration;

/// Limit for route classes without an explicit entry
pub const DEFAULT_ROUTE_LIMIT: u32 = 30;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Tenant every job is recorded under
    pub vendor_id: String,
    /// Largest accepted payload, serialized
    pub max_request_bytes: usize,
    /// Longest accepted string anywhere in a payload or identifier
    pub max_string_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            vendor_id: "specbooks".to_string(),
            max_request_bytes: 102_400,
            max_string_length: 2048,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            vendor_id: env_string("VENDOR_ID", &defaults.vendor_id),
            max_request_bytes: env_or("MAX_REQUEST_BYTES", defaults.max_request_bytes)?,
            max_string_length: env_or("MAX_STRING_LENGTH", defaults.max_string_length)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub window: Duration,
    /// Requests allowed per window, keyed by route class
    pub limits: HashMap<String, u32>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let limits = [
            (JobType::GetCustomer, 30),
            (JobType::GetOpportunity, 30),
            (JobType::CreateOpportunity, 20),
            (JobType::UpdateOpportunity, 20),
        ]
        .into_iter()
        .map(|(job_type, limit)| (job_type.as_str().to_string(), limit))
        .collect();

        Self {
            window: Duration::from_secs(60),
            limits,
        }
    }
}

impl AdmissionConfig {
    /// `RATE_LIMIT_WINDOW_SECONDS` plus `RATE_LIMIT_<ROUTE>` for every job type
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let window_secs: u64 = env_or("RATE_LIMIT_WINDOW_SECONDS", defaults.window.as_secs())?;
        if window_secs == 0 {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW_SECONDS must be positive".to_string(),
            ));
        }

        let mut limits = HashMap::new();
        for job_type in JobType::ALL {
            let route = job_type.as_str();
            let fallback = defaults.limit_for(route);
            limits.insert(
                route.to_string(),
                env_or(&format!("RATE_LIMIT_{}", route), fallback)?,
            );
        }

        Ok(Self {
            window: Duration::from_secs(window_secs),
            limits,
        })
    }

    pub fn with_limit(mut self, route: &str, limit: u32) -> Self {
        self.limits.insert(route.to_string(), limit);
        self
    }

    pub fn limit_for(&self, route: &str) -> u32 {
        self.limits
            .get(route)
            .copied()
            .unwrap_or(DEFAULT_ROUTE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.limit_for("GET_CUSTOMER"), 30);
        assert_eq!(config.limit_for("CREATE_OPPORTUNITY"), 20);
        assert_eq!(config.limit_for("UPDATE_OPPORTUNITY"), 20);
        assert_eq!(config.limit_for("ERP_GET_ORDER_HEADER"), DEFAULT_ROUTE_LIMIT);
        assert_eq!(config.window, Duration::from_secs(60));
    }
}
