//! Environment configuration helpers
//!
//! Every `from_env` constructor in the workspace reads variables through
//! these helpers so a malformed number fails loudly instead of silently
//! falling back to a default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse `key` if set, else return `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{}={:?}", key, raw))),
        _ => Ok(default),
    }
}

/// Millisecond duration from `key`, else `default_ms`.
pub fn env_millis(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_or(key, default_ms).map(Duration::from_millis)
}

pub fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_defaults_and_rejects_garbage() {
        assert_eq!(env_or("ERPGATE_TEST_UNSET_VALUE", 7u32).unwrap(), 7);

        env::set_var("ERPGATE_TEST_BAD_NUMBER", "twelve");
        assert!(matches!(
            env_or("ERPGATE_TEST_BAD_NUMBER", 1u32),
            Err(ConfigError::Invalid(_))
        ));

        env::set_var("ERPGATE_TEST_GOOD_MILLIS", " 250 ");
        assert_eq!(
            env_millis("ERPGATE_TEST_GOOD_MILLIS", 1).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_env_required() {
        assert!(matches!(
            env_required("ERPGATE_TEST_MISSING_SECRET"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
