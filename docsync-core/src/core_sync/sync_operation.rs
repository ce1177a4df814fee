//! Unit of transfer between two remotes
//!
//! A [`SyncOperation`] carries the operations of one document branch and a
//! forward-only status. Status changes are reported to listeners registered
//! with [`SyncOperation::on`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use super::errors::ChannelError;
use crate::core_store::{OperationWithContext, Ordinal};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOperationStatus {
    Unknown,
    /// Handed to a transport, no answer yet
    TransportPending,
    /// Awaiting acknowledgement by the remote or local application
    ExecutionPending,
    Applied,
    Error,
}

impl SyncOperationStatus {
    fn rank(self) -> u8 {
        match self {
            SyncOperationStatus::Unknown => 0,
            SyncOperationStatus::TransportPending => 1,
            SyncOperationStatus::ExecutionPending => 2,
            SyncOperationStatus::Applied | SyncOperationStatus::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncOperationStatus::Applied | SyncOperationStatus::Error)
    }
}

impl fmt::Display for SyncOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncOperationStatus::Unknown => "unknown",
            SyncOperationStatus::TransportPending => "transport-pending",
            SyncOperationStatus::ExecutionPending => "execution-pending",
            SyncOperationStatus::Applied => "applied",
            SyncOperationStatus::Error => "error",
        };
        f.write_str(name)
    }
}

pub type StatusListener = Arc<dyn Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) + Send + Sync>;

struct State {
    status: SyncOperationStatus,
    error: Option<ChannelError>,
}

pub struct SyncOperation {
    pub id: String,
    pub remote_name: String,
    pub document_id: String,
    pub scopes: Vec<String>,
    pub branch: String,
    pub operations: Vec<OperationWithContext>,
    /// Job that wrote the operations, empty for received batches
    pub job_id: String,
    /// Jobs whose sync operations must be delivered before this one
    pub job_dependencies: Vec<String>,
    state: Mutex<State>,
    listeners: Mutex<Vec<StatusListener>>,
}

impl SyncOperation {
    pub fn new(
        remote_name: impl Into<String>,
        document_id: impl Into<String>,
        branch: impl Into<String>,
        operations: Vec<OperationWithContext>,
    ) -> Self {
        let mut scopes: Vec<String> = Vec::new();
        for item in &operations {
            if !scopes.contains(&item.context.scope) {
                scopes.push(item.context.scope.clone());
            }
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_name: remote_name.into(),
            document_id: document_id.into(),
            scopes,
            branch: branch.into(),
            operations,
            job_id: String::new(),
            job_dependencies: Vec::new(),
            state: Mutex::new(State {
                status: SyncOperationStatus::Unknown,
                error: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>, dependencies: Vec<String>) -> Self {
        self.job_id = job_id.into();
        self.job_dependencies = dependencies;
        self
    }

    pub fn status(&self) -> SyncOperationStatus {
        lock(&self.state).status
    }

    pub fn error(&self) -> Option<ChannelError> {
        lock(&self.state).error.clone()
    }

    /// Highest store ordinal among the carried operations
    pub fn ordinal(&self) -> Ordinal {
        self.operations.iter().map(|item| item.context.ordinal).max().unwrap_or(0)
    }

    /// Register a status listener, called as `(operation, previous, next)`
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    pub fn transported(&self) -> bool {
        self.transition(SyncOperationStatus::TransportPending, None)
    }

    pub fn started(&self) -> bool {
        self.transition(SyncOperationStatus::ExecutionPending, None)
    }

    pub fn executed(&self) -> bool {
        self.transition(SyncOperationStatus::Applied, None)
    }

    pub fn failed(&self, error: ChannelError) -> bool {
        self.transition(SyncOperationStatus::Error, Some(error))
    }

    /// Move forward to `next`. Returns false, changing nothing, when the
    /// operation is terminal or already at or past `next`.
    fn transition(&self, next: SyncOperationStatus, error: Option<ChannelError>) -> bool {
        let previous = {
            let mut state = lock(&self.state);
            if state.status.is_terminal() || next.rank() <= state.status.rank() {
                return false;
            }
            let previous = state.status;
            state.status = next;
            if error.is_some() {
                state.error = error;
            }
            previous
        };

        let listeners: Vec<StatusListener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(self, previous, next);
        }
        true
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("remote_name", &self.remote_name)
            .field("document_id", &self.document_id)
            .field("scopes", &self.scopes)
            .field("branch", &self.branch)
            .field("operations", &self.operations.len())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::OperationContext;
    use crate::core_sync::errors::{ChannelErrorCause, ChannelErrorSource};
    use crate::test_utils::fixtures::make_operation;

    fn item(action_id: &str, scope: &str, ordinal: u64) -> OperationWithContext {
        OperationWithContext {
            operation: make_operation(0, action_id, 1),
            context: OperationContext {
                document_id: "doc".into(),
                document_type: "counter".into(),
                scope: scope.into(),
                branch: "main".into(),
                ordinal,
            },
        }
    }

    fn sync_op() -> SyncOperation {
        SyncOperation::new(
            "remote",
            "doc",
            "main",
            vec![item("a", "global", 4), item("b", "local", 9), item("c", "global", 7)],
        )
    }

    #[test]
    fn test_scopes_and_ordinal() {
        let op = sync_op();
        assert_eq!(op.scopes, vec!["global".to_string(), "local".to_string()]);
        assert_eq!(op.ordinal(), 9);
        assert_eq!(op.status(), SyncOperationStatus::Unknown);
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let op = sync_op();
        assert!(op.transported());
        assert!(op.started());
        assert!(!op.transported());
        assert_eq!(op.status(), SyncOperationStatus::ExecutionPending);

        assert!(op.executed());
        assert!(!op.failed(ChannelError::new(ChannelErrorSource::Outbox, ChannelErrorCause::ShutDown)));
        assert_eq!(op.status(), SyncOperationStatus::Applied);
        assert!(op.error().is_none());
    }

    #[test]
    fn test_failure_records_error() {
        let op = sync_op();
        op.started();
        let error = ChannelError::new(ChannelErrorSource::Inbox, ChannelErrorCause::Apply("boom".into()));
        assert!(op.failed(error.clone()));
        assert_eq!(op.status(), SyncOperationStatus::Error);
        assert_eq!(op.error(), Some(error));
        assert!(!op.executed());
    }

    #[test]
    fn test_listeners_see_each_change() {
        let op = sync_op();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        op.on(move |_, previous, next| sink.lock().unwrap().push((previous, next)));

        op.started();
        op.started();
        op.executed();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SyncOperationStatus::Unknown, SyncOperationStatus::ExecutionPending),
                (SyncOperationStatus::ExecutionPending, SyncOperationStatus::Applied),
            ]
        );
    }
}
