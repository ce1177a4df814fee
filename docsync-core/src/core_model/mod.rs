//! Document models and pure operation algorithms: hashing, id derivation,
//! garbage collection, merge and reshuffle.

pub mod errors;
pub mod model;
pub mod operations;
pub mod reshuffle;

pub use errors::{IntegrityIssue, ModelError, ModelResult};
pub use model::{
    create_document_action, delete_document_action, is_deleted, DocumentModel, ModelRegistry, CREATE_DOCUMENT,
    DELETE_DOCUMENT,
};
pub use operations::{
    check_cleaned_operations_integrity, derive_operation_id, derive_reshuffled_id, filter_duplicated_operations,
    garbage_collect, hash_state, merge, next_skip_number, precedes, sort_operations, split, IndexPosition,
    OperationIndex,
};
pub use reshuffle::{reshuffle_by_timestamp, reshuffle_by_timestamp_and_index};
