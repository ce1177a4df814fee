//! Read model over the operation log

pub mod document_view;
pub mod meta_cache;

pub use document_view::{Document, DocumentHeader, DocumentSnapshot, DocumentView};
pub use meta_cache::DocumentMetaCache;
