//! Worker configuration

use erpgate_queue::{BrokerConfig, WorkerConfig};
use erpgate_upstream::config::{env_millis, env_or, ConfigError};
use erpgate_upstream::{ErpOperation, ProtectionConfig, RetryPolicy};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Quiet period an entity's buffer must reach before it is flushed
    pub coalesce_window: Duration,
    /// A transient failure on this delivery is treated as terminal
    pub max_deliveries: u32,
    /// Backoff used to delay redelivery after a transient failure
    pub redelivery: RetryPolicy,
    pub default_timeout: Duration,
    pub timeouts: HashMap<String, Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(5000),
            max_deliveries: 10,
            redelivery: RetryPolicy::default(),
            default_timeout: Duration::from_secs(25),
            timeouts: HashMap::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let protection = ProtectionConfig::from_env()?;
        Ok(Self {
            coalesce_window: env_millis("UPDATE_COALESCE_WINDOW_MS", 5000)?,
            max_deliveries: env_or("JOB_MAX_DELIVERIES", 10u32)?.max(1),
            redelivery: protection.retry,
            default_timeout: protection.default_timeout,
            timeouts: protection.timeouts,
        })
    }

    pub fn timeout_for(&self, operation: ErpOperation) -> Duration {
        self.timeouts
            .get(operation.as_str())
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// `QUEUE_LOCK_DURATION_MS` and `QUEUE_MAX_DELIVERY_COUNT`
pub fn broker_config_from_env() -> Result<BrokerConfig, ConfigError> {
    let defaults = BrokerConfig::default();
    Ok(BrokerConfig {
        lock_duration: env_millis(
            "QUEUE_LOCK_DURATION_MS",
            defaults.lock_duration.as_millis() as u64,
        )?,
        max_delivery_count: env_or("QUEUE_MAX_DELIVERY_COUNT", defaults.max_delivery_count)?,
    })
}

/// `WORKER_MAX_CONCURRENCY`, `WORKER_POLL_INTERVAL_MS` and
/// `WORKER_LOCK_RENEWAL_MS`
pub fn worker_config_from_env() -> Result<WorkerConfig, ConfigError> {
    let defaults = WorkerConfig::default();
    Ok(WorkerConfig {
        max_concurrency: env_or("WORKER_MAX_CONCURRENCY", defaults.max_concurrency)?.max(1),
        poll_interval: env_millis(
            "WORKER_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?,
        lock_renewal_interval: env_millis(
            "WORKER_LOCK_RENEWAL_MS",
            defaults.lock_renewal_interval.as_millis() as u64,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_override_by_operation() {
        let mut config = ProcessorConfig::default();
        config
            .timeouts
            .insert("getCustomer".to_string(), Duration::from_secs(3));

        assert_eq!(
            config.timeout_for(ErpOperation::GetCustomer),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.timeout_for(ErpOperation::UpdateOpportunity),
            Duration::from_secs(25)
        );
    }
}
