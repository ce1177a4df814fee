//! Job definitions and status records

use serde::{Deserialize, Serialize};

use crate::core_store::{now_utc_ms, Action, Operation, OperationWithContext, GLOBAL_SCOPE};

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Reduce local actions and append the results
    Mutate {
        actions: Vec<Action>,
        /// Known up front for creations; looked up in the log otherwise
        document_type: Option<String>,
    },
    /// Merge operations received from a remote into one stream
    Load {
        operations: Vec<Operation>,
        document_type: String,
        source_remote: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub kind: JobKind,
    /// Jobs that must finish before this one may run
    pub queue_hint: Vec<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub error_history: Vec<String>,
    pub created_at_utc_ms: u64,
}

impl Job {
    pub fn mutate(document_id: impl Into<String>, branch: impl Into<String>, actions: Vec<Action>) -> Self {
        let scope = actions
            .first()
            .map(|a| a.scope.clone())
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string());

        Self::new(
            document_id.into(),
            scope,
            branch.into(),
            JobKind::Mutate {
                actions,
                document_type: None,
            },
        )
    }

    pub fn load(
        document_id: impl Into<String>,
        scope: impl Into<String>,
        branch: impl Into<String>,
        document_type: impl Into<String>,
        operations: Vec<Operation>,
        source_remote: Option<String>,
    ) -> Self {
        Self::new(
            document_id.into(),
            scope.into(),
            branch.into(),
            JobKind::Load {
                operations,
                document_type: document_type.into(),
                source_remote,
            },
        )
    }

    fn new(document_id: String, scope: String, branch: String, kind: JobKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id,
            scope,
            branch,
            kind,
            queue_hint: Vec::new(),
            retry_count: 0,
            last_error: None,
            error_history: Vec::new(),
            created_at_utc_ms: now_utc_ms(),
        }
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        if let JobKind::Mutate { document_type: slot, .. } = &mut self.kind {
            *slot = Some(document_type.into());
        }
        self
    }

    pub fn with_queue_hint(mut self, dependencies: Vec<String>) -> Self {
        self.queue_hint = dependencies;
        self
    }

    pub fn source_remote(&self) -> Option<&str> {
        match &self.kind {
            JobKind::Load { source_remote, .. } => source_remote.as_deref(),
            JobKind::Mutate { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub document_id: String,
    #[serde(flatten)]
    pub status: JobStatus,
    /// Operations the job wrote, filled in on completion
    pub operations: Vec<OperationWithContext>,
    pub created_at_utc_ms: u64,
    pub completed_at_utc_ms: Option<u64>,
}

impl JobInfo {
    pub fn pending(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            document_id: job.document_id.clone(),
            status: JobStatus::Pending,
            operations: Vec::new(),
            created_at_utc_ms: job.created_at_utc_ms,
            completed_at_utc_ms: None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::increment;

    #[test]
    fn test_mutate_job_takes_scope_of_first_action() {
        let job = Job::mutate("doc", "main", vec![increment(1)]).with_document_type("counter");
        assert_eq!(job.scope, GLOBAL_SCOPE);
        assert!(matches!(
            &job.kind,
            JobKind::Mutate { document_type: Some(t), .. } if t == "counter"
        ));
        assert_eq!(job.source_remote(), None);
    }

    #[test]
    fn test_job_info_serializes_flat_status() {
        let job = Job::mutate("doc", "main", vec![]);
        let mut info = JobInfo::pending(&job);
        info.status = JobStatus::Failed { error: "boom".into() };

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        assert_eq!(info.error(), Some("boom"));
        assert!(info.status.is_terminal());
    }
}
