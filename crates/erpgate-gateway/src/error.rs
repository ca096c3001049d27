//! Gateway error types with status and body mapping

use erpgate_persist::StorageError;
use erpgate_queue::{JobId, QueueError};
use erpgate_upstream::UpstreamError;
use serde::Serialize;
use tracing::error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Rate limit exceeded for {route}")]
    RateLimited { route: String, retry_after_secs: u64 },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Error response body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "BAD_REQUEST",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Upstream(e) => e.category().code(),
            GatewayError::Storage(_) | GatewayError::Queue(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Upstream(e) => e.category().http_status(),
            GatewayError::Storage(_) | GatewayError::Queue(_) => 500,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            GatewayError::Upstream(e) => e.retry_after().map(|d| d.as_secs().max(1)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::RateLimited { .. } => true,
            GatewayError::Upstream(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let message = match self {
            GatewayError::Storage(_) | GatewayError::Queue(_) => {
                // Don't expose internal errors to clients
                error!(error = %self, "Internal error");
                "An internal error occurred".to_string()
            }
            _ => self.to_string(),
        };

        ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message,
                retry_after_seconds: self.retry_after_secs(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_rate_limited_body() {
        let err = GatewayError::RateLimited {
            route: "GET_CUSTOMER".into(),
            retry_after_secs: 12,
        };
        assert_eq!(err.status(), 429);
        let body = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["retryAfterSeconds"], 12);
    }

    #[test]
    fn test_not_found_omits_retry_after() {
        let err = GatewayError::NotFound(Uuid::new_v4());
        assert_eq!(err.status(), 404);
        let body = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert!(body["error"].get("retryAfterSeconds").is_none());
    }

    #[test]
    fn test_upstream_mapping() {
        let unavailable = GatewayError::from(UpstreamError::Status {
            status: 503,
            body: String::new(),
        });
        assert_eq!(unavailable.status(), 503);
        assert_eq!(unavailable.code(), "UPSTREAM_UNAVAILABLE");
        assert!(unavailable.is_retryable());

        let throttled = GatewayError::from(UpstreamError::Throttled {
            scope: "concurrency",
            retry_after: Duration::from_secs(1),
        });
        assert_eq!(throttled.status(), 429);
        assert_eq!(throttled.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_internal_errors_are_masked() {
        let err = GatewayError::from(StorageError::Connection("db down at 10.0.0.3".into()));
        let body = err.to_response();
        assert_eq!(err.status(), 500);
        assert_eq!(body.error.message, "An internal error occurred");
    }
}
