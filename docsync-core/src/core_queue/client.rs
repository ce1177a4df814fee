//! Job submission
//!
//! [`JobClient`] registers jobs with the tracker before handing them to the
//! queue, so a status is always available once a job id has been returned.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::errors::{JobError, JobResult};
use super::job::{Job, JobInfo};
use super::queue::InMemoryQueue;
use super::tracker::JobTracker;
use crate::core_store::{AbortSignal, Action, Operation, OperationWithContext, DOCUMENT_SCOPE};

/// Applies operations received from a remote
#[async_trait]
pub trait OperationLoader: Send + Sync {
    /// Load every operation of one document branch and wait for the result.
    /// One job info is returned per scope touched.
    async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<OperationWithContext>,
        source_remote: &str,
        signal: Option<&AbortSignal>,
    ) -> JobResult<Vec<JobInfo>>;
}

#[derive(Clone)]
pub struct JobClient {
    queue: Arc<InMemoryQueue>,
    tracker: Arc<JobTracker>,
}

impl JobClient {
    pub fn new(queue: Arc<InMemoryQueue>, tracker: Arc<JobTracker>) -> Self {
        Self { queue, tracker }
    }

    /// Queue a job and return its initial status
    pub fn submit(&self, job: Job) -> JobResult<JobInfo> {
        self.tracker.register(&job);
        let info = JobInfo::pending(&job);

        if let Err(e) = self.queue.enqueue(job) {
            self.tracker.failed(&info.id, e.to_string());
            return Err(e);
        }
        Ok(info)
    }

    pub fn mutate(
        &self,
        document_id: &str,
        branch: &str,
        actions: Vec<Action>,
        document_type: Option<&str>,
    ) -> JobResult<JobInfo> {
        let mut job = Job::mutate(document_id, branch, actions);
        if let Some(document_type) = document_type {
            job = job.with_document_type(document_type);
        }
        self.submit(job)
    }

    /// Queue mutations that run in order, each waiting on the one before
    pub fn mutate_batch(&self, document_id: &str, branch: &str, batches: Vec<Vec<Action>>) -> JobResult<Vec<JobInfo>> {
        let mut infos: Vec<JobInfo> = Vec::with_capacity(batches.len());
        for actions in batches {
            let mut job = Job::mutate(document_id, branch, actions);
            if let Some(previous) = infos.last() {
                job = job.with_queue_hint(vec![previous.id.clone()]);
            }
            infos.push(self.submit(job)?);
        }
        Ok(infos)
    }

    /// Queue one load job per scope. The `document` scope goes first and the
    /// other scopes wait for it.
    pub fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<OperationWithContext>,
        source_remote: Option<&str>,
    ) -> JobResult<Vec<JobInfo>> {
        let mut by_scope: BTreeMap<String, (String, Vec<Operation>)> = BTreeMap::new();
        for item in operations {
            if item.context.document_id != document_id || item.context.branch != branch {
                return Err(JobError::Invalid(format!(
                    "operation {} belongs to {}:{}, not {}:{}",
                    item.operation.id, item.context.document_id, item.context.branch, document_id, branch
                )));
            }
            by_scope
                .entry(item.context.scope.clone())
                .or_insert_with(|| (item.context.document_type.clone(), Vec::new()))
                .1
                .push(item.operation);
        }

        let source = source_remote.map(str::to_string);
        let mut infos = Vec::with_capacity(by_scope.len());
        let mut hint = Vec::new();

        if let Some((document_type, ops)) = by_scope.remove(DOCUMENT_SCOPE) {
            let job = Job::load(document_id, DOCUMENT_SCOPE, branch, document_type, ops, source.clone());
            let info = self.submit(job)?;
            hint.push(info.id.clone());
            infos.push(info);
        }

        for (scope, (document_type, ops)) in by_scope {
            let job = Job::load(document_id, scope, branch, document_type, ops, source.clone())
                .with_queue_hint(hint.clone());
            infos.push(self.submit(job)?);
        }

        debug!(document_id, branch, jobs = infos.len(), "load queued");
        Ok(infos)
    }

    pub fn get_status(&self, job_id: &str) -> Option<JobInfo> {
        self.tracker.get_status(job_id)
    }

    pub async fn wait(&self, job_id: &str, signal: Option<&AbortSignal>) -> JobResult<JobInfo> {
        self.tracker.wait_for_job(job_id, signal).await
    }
}

#[async_trait]
impl OperationLoader for JobClient {
    async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<OperationWithContext>,
        source_remote: &str,
        signal: Option<&AbortSignal>,
    ) -> JobResult<Vec<JobInfo>> {
        let queued = JobClient::load(self, document_id, branch, operations, Some(source_remote))?;

        let mut finished = Vec::with_capacity(queued.len());
        for info in queued {
            finished.push(self.wait(&info.id, signal).await?);
        }
        Ok(finished)
    }
}
