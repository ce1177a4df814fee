use thiserror::Error;

/// Gap or overlap found in a garbage-collected operation sequence
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityIssue {
    #[error("Missing index: expected {expected} with skip 0 or equivalent, got index {index} with skip {skip}")]
    MissingIndex { expected: u64, index: u64, skip: u64 },

    #[error("Duplicated index: expected {expected} with skip 0 or equivalent, got index {index} with skip {skip}")]
    DuplicatedIndex { expected: u64, index: u64, skip: u64 },
}

/// Errors raised by document models and operation helpers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Unknown document type: {0}")]
    UnknownDocumentType(String),

    #[error("Unknown scope '{scope}' for document type {document_type}")]
    UnknownScope { document_type: String, scope: String },

    /// The model refused the action; never retried
    #[error("Action {action_id} rejected: {reason}")]
    Rejected { action_id: String, reason: String },

    #[error("Document {0} is deleted")]
    DocumentDeleted(String),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityIssue),
}

pub type ModelResult<T> = Result<T, ModelError>;

impl ModelError {
    pub fn rejected(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::Rejected {
            action_id: action_id.into(),
            reason: reason.into(),
        }
    }
}
