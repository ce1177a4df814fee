use thiserror::Error;

use crate::core_model::ModelError;
use crate::core_store::StoreError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Local and incoming history diverged too far to reshuffle
    #[error("Excessive reshuffle on {document_id}: more than {threshold} conflicting operations")]
    SkipThresholdExceeded { document_id: String, threshold: usize },

    #[error("Queue is blocked")]
    QueueBlocked,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Job aborted")]
    Aborted,
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    /// A retry against the refreshed head may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::StreamKey;

    #[test]
    fn test_retryable_only_for_revision_mismatch() {
        let mismatch = JobError::from(StoreError::RevisionMismatch {
            stream: StreamKey::new("d", "global", "main"),
            expected: 1,
            actual: 2,
        });
        assert!(mismatch.is_retryable());
        assert!(!JobError::QueueBlocked.is_retryable());
        assert!(!JobError::from(ModelError::DocumentDeleted("d".into())).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = JobError::SkipThresholdExceeded {
            document_id: "doc".into(),
            threshold: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Excessive reshuffle on doc: more than 1000 conflicting operations"
        );
        assert_eq!(JobError::from(StoreError::Aborted).to_string(), "Operation aborted");
    }
}
