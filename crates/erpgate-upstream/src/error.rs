//! Upstream error types and classification

use std::time::Duration;

/// Transport failure signatures that are worth retrying.
const TRANSIENT_SIGNATURES: [&str; 10] = [
    "etimedout",
    "econnreset",
    "enotfound",
    "econnrefused",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "dns error",
    "connect error",
];

/// Machine-readable failure categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    RateLimited,
    UpstreamTransient,
    UpstreamTerminal,
    Infrastructure,
}

impl ErrorCategory {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "BAD_REQUEST",
            ErrorCategory::RateLimited => "RATE_LIMITED",
            ErrorCategory::UpstreamTransient => "UPSTREAM_UNAVAILABLE",
            ErrorCategory::UpstreamTerminal => "UPSTREAM_ERROR",
            ErrorCategory::Infrastructure => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::Validation => 400,
            ErrorCategory::RateLimited => 429,
            ErrorCategory::UpstreamTransient => 503,
            ErrorCategory::UpstreamTerminal => 502,
            ErrorCategory::Infrastructure => 500,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("ERP returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Throttled by {scope} limit, retry after {}s", retry_after.as_secs())]
    Throttled {
        scope: &'static str,
        retry_after: Duration,
    },
}

impl UpstreamError {
    /// HTTP-equivalent status; a timeout counts as 504.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Timeout { .. } => Some(504),
            UpstreamError::Throttled { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            UpstreamError::Timeout { .. } | UpstreamError::Throttled { .. } => true,
            UpstreamError::Transport(message) => {
                let message = message.to_lowercase();
                TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
            }
            UpstreamError::Credential(_) | UpstreamError::InvalidResponse(_) => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            UpstreamError::Throttled { .. } => ErrorCategory::RateLimited,
            e if e.is_transient() => ErrorCategory::UpstreamTransient,
            _ => ErrorCategory::UpstreamTerminal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
