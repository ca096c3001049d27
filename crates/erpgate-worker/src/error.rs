//! Job execution errors

use erpgate_persist::StorageError;
use erpgate_queue::QueueError;
use erpgate_upstream::{ErrorCategory, GovernorError, UpstreamError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The message lacks a field its job type requires
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Governor error: {0}")]
    Governor(#[from] GovernorError),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Upstream(e) if e.is_transient())
    }

    /// Store, queue or limiter failures; the job itself is not at fault
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JobError::Storage(_) | JobError::Queue(_) | JobError::Governor(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Invalid(_) => ErrorCategory::Validation,
            JobError::Upstream(e) => e.category(),
            _ => ErrorCategory::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transient = JobError::from(UpstreamError::Status {
            status: 502,
            body: String::new(),
        });
        assert!(transient.is_transient());
        assert!(!transient.is_infrastructure());

        let invalid = JobError::Invalid("customerId is required".into());
        assert!(!invalid.is_transient());
        assert_eq!(invalid.category(), ErrorCategory::Validation);

        let storage = JobError::from(StorageError::Connection("pool closed".into()));
        assert!(storage.is_infrastructure());
        assert_eq!(storage.category().code(), "INTERNAL_ERROR");
    }
}
