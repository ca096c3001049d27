//! Request validation
//!
//! Payloads are opaque to the gateway, but their shape and size are bounded
//! before anything is written to the store.

use serde_json::Value;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// Nesting depth beyond which a payload is rejected
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_request_bytes: usize,
    pub max_string_length: usize,
}

impl From<&GatewayConfig> for Limits {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_request_bytes: config.max_request_bytes,
            max_string_length: config.max_string_length,
        }
    }
}

/// Trim and bound an identifier such as a customer id or idempotency key.
pub fn identifier(field: &str, value: &str, limits: Limits) -> GatewayResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Validation(format!("{} is required", field)));
    }
    if trimmed.chars().count() > limits.max_string_length {
        return Err(GatewayError::Validation(format!(
            "{} exceeds {} characters",
            field, limits.max_string_length
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(GatewayError::Validation(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(trimmed.to_string())
}

/// A JSON object within the size, string-length and depth bounds.
pub fn payload(value: &Value, limits: Limits) -> GatewayResult<()> {
    if !value.is_object() {
        return Err(GatewayError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }

    let size = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Validation(format!("payload is not serializable: {}", e)))?
        .len();
    if size > limits.max_request_bytes {
        return Err(GatewayError::Validation(format!(
            "payload is {} bytes (max {})",
            size, limits.max_request_bytes
        )));
    }

    check_strings(value, limits.max_string_length, 0)
}

/// Update payloads must also carry at least one field.
pub fn update_payload(value: &Value, limits: Limits) -> GatewayResult<()> {
    payload(value, limits)?;
    if value.as_object().is_some_and(|fields| fields.is_empty()) {
        return Err(GatewayError::Validation(
            "update payload must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_strings(value: &Value, max: usize, depth: usize) -> GatewayResult<()> {
    if depth > MAX_DEPTH {
        return Err(GatewayError::Validation(format!(
            "payload nesting exceeds {} levels",
            MAX_DEPTH
        )));
    }

    let too_long = |s: &str| s.chars().count() > max;
    match value {
        Value::String(s) if too_long(s) => Err(GatewayError::Validation(format!(
            "string value exceeds {} characters",
            max
        ))),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_strings(item, max, depth + 1)),
        Value::Object(fields) => fields.iter().try_for_each(|(key, item)| {
            if too_long(key) {
                return Err(GatewayError::Validation(format!(
                    "field name exceeds {} characters",
                    max
                )));
            }
            check_strings(item, max, depth + 1)
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> Limits {
        Limits {
            max_request_bytes: 256,
            max_string_length: 16,
        }
    }

    #[test]
    fn test_identifier_trims_and_bounds() {
        assert_eq!(identifier("customerId", "  C001 ", limits()).unwrap(), "C001");
        assert!(identifier("customerId", "   ", limits()).is_err());
        assert!(identifier("customerId", &"x".repeat(17), limits()).is_err());
        assert!(identifier("customerId", "C0\n01", limits()).is_err());
    }

    #[test]
    fn test_payload_shape() {
        assert!(payload(&json!({"a": 1}), limits()).is_ok());
        assert!(payload(&json!([1, 2]), limits()).is_err());
        assert!(payload(&json!("text"), limits()).is_err());
    }

    #[test]
    fn test_nested_strings_are_bounded() {
        let nested = json!({"lines": [{"note": "x".repeat(17)}]});
        let err = payload(&nested, limits()).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_size_limit() {
        let fields: serde_json::Map<String, Value> = (0..40)
            .map(|i| (format!("f{}", i), json!("value")))
            .collect();
        assert!(payload(&Value::Object(fields), limits()).is_err());
    }

    #[test]
    fn test_empty_update_rejected() {
        assert!(update_payload(&json!({}), limits()).is_err());
        assert!(update_payload(&json!({"Stage": "Won"}), limits()).is_ok());
    }
}
