//! Job status tracking

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::Notify;

use super::errors::{JobError, JobResult};
use super::job::{Job, JobInfo, JobStatus};
use crate::core_store::{now_utc_ms, AbortSignal, OperationWithContext};
use crate::lock;

#[derive(Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobInfo>>,
    changed: Notify,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: &Job) {
        lock(&self.jobs).insert(job.id.clone(), JobInfo::pending(job));
    }

    pub fn running(&self, job_id: &str) {
        self.update(job_id, JobStatus::Running, None);
    }

    pub fn completed(&self, job_id: &str, operations: Vec<OperationWithContext>) {
        self.update(job_id, JobStatus::Completed, Some(operations));
    }

    pub fn failed(&self, job_id: &str, error: impl Into<String>) {
        self.update(job_id, JobStatus::Failed { error: error.into() }, None);
    }

    fn update(&self, job_id: &str, status: JobStatus, operations: Option<Vec<OperationWithContext>>) {
        {
            let mut jobs = lock(&self.jobs);
            let Some(info) = jobs.get_mut(job_id) else {
                return;
            };
            if status.is_terminal() {
                info.completed_at_utc_ms = Some(now_utc_ms());
            }
            info.status = status;
            if let Some(operations) = operations {
                info.operations = operations;
            }
        }
        self.changed.notify_waiters();
    }

    pub fn get_status(&self, job_id: &str) -> Option<JobInfo> {
        lock(&self.jobs).get(job_id).cloned()
    }

    /// Resolve once the job completed or failed
    pub async fn wait_for_job(&self, job_id: &str, signal: Option<&AbortSignal>) -> JobResult<JobInfo> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let info = self
                .get_status(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if info.status.is_terminal() {
                return Ok(info);
            }

            match signal {
                Some(signal) => {
                    tokio::select! {
                        _ = signal.cancelled() => return Err(JobError::Aborted),
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::increment;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_status_transitions() {
        let tracker = JobTracker::new();
        let job = Job::mutate("doc", "main", vec![increment(1)]);
        tracker.register(&job);

        assert_eq!(tracker.get_status(&job.id).unwrap().status, JobStatus::Pending);
        tracker.running(&job.id);
        assert_eq!(tracker.get_status(&job.id).unwrap().status, JobStatus::Running);

        tracker.failed(&job.id, "boom");
        let info = tracker.get_status(&job.id).unwrap();
        assert_eq!(info.error(), Some("boom"));
        assert!(info.completed_at_utc_ms.is_some());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_completion() {
        let tracker = Arc::new(JobTracker::new());
        let job = Job::mutate("doc", "main", vec![increment(1)]);
        tracker.register(&job);

        let waiter = {
            let tracker = tracker.clone();
            let id = job.id.clone();
            tokio::spawn(async move { tracker.wait_for_job(&id, None).await })
        };

        tokio::task::yield_now().await;
        tracker.running(&job.id);
        tracker.completed(&job.id, Vec::new());

        let info = waiter.await.unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_unknown_and_aborted() {
        let tracker = JobTracker::new();
        assert!(matches!(
            tracker.wait_for_job("missing", None).await,
            Err(JobError::NotFound(_))
        ));

        let job = Job::mutate("doc", "main", vec![]);
        tracker.register(&job);
        let signal = AbortSignal::new();
        signal.cancel();
        assert!(matches!(
            tracker.wait_for_job(&job.id, Some(&signal)).await,
            Err(JobError::Aborted)
        ));
    }
}
