//! Core data types shared by the operation log, the read model and sync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global, store-wide write position. Assigned by the operation log, strictly increasing.
pub type Ordinal = u64;

pub const DEFAULT_BRANCH: &str = "main";
pub const DOCUMENT_SCOPE: &str = "document";
pub const GLOBAL_SCOPE: &str = "global";
pub const LOCAL_SCOPE: &str = "local";

/// Milliseconds since the Unix epoch
pub fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identifies one append-only log: (documentId, scope, branch)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
}

impl StreamKey {
    pub fn new(document_id: impl Into<String>, scope: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            scope: scope.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

/// Opaque document-model action. Only `id`, `scope` and `timestamp_utc_ms` are
/// interpreted by the engine; `input` is handed to the reducer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub scope: String,
    pub input: Value,
    pub timestamp_utc_ms: u64,
}

impl Action {
    /// New action with a random id, stamped now
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            scope: scope.into(),
            input,
            timestamp_utc_ms: now_utc_ms(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_utc_ms: u64) -> Self {
        self.timestamp_utc_ms = timestamp_utc_ms;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Immutable log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub index: u64,
    /// Number of preceding entries this one supersedes; only a reshuffle sets it
    pub skip: u64,
    pub hash: String,
    pub timestamp_utc_ms: u64,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_op_id: Option<String>,
    /// Scope state after this operation was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where an operation lives and when it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
    pub ordinal: Ordinal,
}

impl OperationContext {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(&self.document_id, &self.scope, &self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationWithContext {
    pub operation: Operation,
    pub context: OperationContext,
}

/// Cursor-based paging. `cursor` is the last position already seen (an
/// index for stream reads, an ordinal for global reads).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingOptions {
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
}

impl PagingOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: u64, limit: usize) -> Self {
        Self {
            cursor: Some(cursor),
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResults<T> {
    pub results: Vec<T>,
    /// Pass back as `PagingOptions::cursor` to fetch the next page; `None` when exhausted
    pub next_cursor: Option<u64>,
}

impl<T> PagedResults<T> {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Extra constraints for `get_since`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    /// Only operations with `timestamp_utc_ms` strictly greater than this
    pub since_timestamp_utc_ms: Option<u64>,
}

/// Scope and branch selection for reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    pub branch: String,
    /// Empty means every scope
    pub scopes: Vec<String>,
}

impl Default for ViewFilter {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH.to_string(),
            scopes: Vec::new(),
        }
    }
}

impl ViewFilter {
    pub fn scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn includes_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

/// Head revision of every scope of one document branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRevisions {
    pub revision: std::collections::BTreeMap<String, u64>,
    pub latest_timestamp_utc_ms: u64,
}
