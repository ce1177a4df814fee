//! In-memory job queue
//!
//! Jobs wait in FIFO queues keyed by (documentId, scope, branch). At most one
//! job per document executes at a time; jobs of other documents proceed in
//! parallel. Documents are served in the order their queues appeared, and an
//! emptied queue goes to the back when it is recreated. Within one document the
//! earliest enqueued runnable job runs first, whatever its scope.
//!
//! A job whose `queue_hint` names jobs still pending or executing is passed
//! over until they complete or fail. Hints must name jobs enqueued before the
//! dependent.

use hashlink::LinkedHashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::errors::{JobError, JobResult};
use super::job::Job;
use crate::core_store::{check_aborted, AbortSignal, StreamKey};
use crate::events::{Event, EventBus};
use crate::lock;

type DrainedCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueState {
    queues: LinkedHashMap<StreamKey, VecDeque<Job>>,
    /// documentId → ids of jobs currently executing
    executing: HashMap<String, HashSet<String>>,
    /// Pending and executing jobs by id
    jobs: HashMap<String, Job>,
    /// Enqueue sequence of each pending job
    arrival: HashMap<String, u64>,
    next_arrival: u64,
    blocked: bool,
    paused: bool,
    on_drained: Option<DrainedCallback>,
}

impl QueueState {
    fn dependencies_met(&self, job: &Job) -> bool {
        job.queue_hint.iter().all(|dep| !self.jobs.contains_key(dep))
    }

    fn is_drained(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty) && self.executing.values().all(HashSet::is_empty)
    }

    fn push(&mut self, job: Job) -> JobResult<()> {
        if self.blocked {
            return Err(JobError::QueueBlocked);
        }

        let key = StreamKey::new(&job.document_id, &job.scope, &job.branch);
        self.arrival.insert(job.id.clone(), self.next_arrival);
        self.next_arrival += 1;
        self.jobs.insert(job.id.clone(), job.clone());
        self.queues.entry(key).or_insert_with(VecDeque::new).push_back(job);
        Ok(())
    }

    /// Forget a pending job that left its queue without running
    fn forget(&mut self, job_id: &str) {
        self.jobs.remove(job_id);
        self.arrival.remove(job_id);
    }

    fn release(&mut self, job_id: &str) -> Option<Job> {
        let job = self.jobs.remove(job_id)?;
        if let Some(set) = self.executing.get_mut(&job.document_id) {
            set.remove(job_id);
            if set.is_empty() {
                self.executing.remove(&job.document_id);
            }
        }
        Some(job)
    }

    fn take_drained_callback(&mut self) -> Option<DrainedCallback> {
        if self.is_drained() {
            self.on_drained.take()
        } else {
            None
        }
    }
}

pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    events: EventBus,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            events,
            available: Notify::new(),
        }
    }

    pub fn enqueue(&self, job: Job) -> JobResult<()> {
        let (job_id, document_id) = (job.id.clone(), job.document_id.clone());
        lock(&self.state).push(job)?;
        self.announce(job_id, document_id);
        Ok(())
    }

    fn announce(&self, job_id: String, document_id: String) {
        debug!(job_id = %job_id, document_id = %document_id, "job enqueued");
        self.events.emit(Event::JobPending { job_id, document_id });
        self.available.notify_one();
    }

    /// Next runnable job, or `None` when everything pending is waiting on a
    /// busy document or an unfinished dependency
    pub fn dequeue_next(&self, signal: Option<&AbortSignal>) -> JobResult<Option<Job>> {
        check_aborted(signal).map_err(|_| JobError::Aborted)?;

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.paused {
            return Ok(None);
        }

        // The first document with a runnable job is served; among its queues
        // the job with the lowest arrival wins.
        let mut chosen: Option<(StreamKey, usize, u64)> = None;
        for (key, queue) in state.queues.iter() {
            if state.executing.contains_key(&key.document_id) {
                continue;
            }
            if let Some((current, _, _)) = &chosen {
                if current.document_id != key.document_id {
                    continue;
                }
            }
            let runnable = queue.iter().enumerate().find(|(_, job)| state.dependencies_met(job));
            if let Some((position, job)) = runnable {
                let arrival = state.arrival.get(&job.id).copied().unwrap_or(u64::MAX);
                if chosen.as_ref().map_or(true, |(_, _, best)| arrival < *best) {
                    chosen = Some((key.clone(), position, arrival));
                }
            }
        }

        let Some((key, position, _)) = chosen else {
            return Ok(None);
        };

        let queue = state
            .queues
            .get_mut(&key)
            .ok_or_else(|| JobError::NotFound(key.to_string()))?;
        let job = queue
            .remove(position)
            .ok_or_else(|| JobError::NotFound(key.to_string()))?;
        if queue.is_empty() {
            state.queues.remove(&key);
        }

        state.arrival.remove(&job.id);
        state
            .executing
            .entry(job.document_id.clone())
            .or_default()
            .insert(job.id.clone());

        Ok(Some(job))
    }

    /// Wait until a job may have become runnable
    pub async fn wait_for_work(&self) {
        self.available.notified().await;
    }

    pub fn complete_job(&self, job_id: &str) {
        self.finish(job_id);
    }

    /// Release a failed job and publish `JobFailed`. Dependents still run.
    pub fn fail_job(&self, job_id: &str, error: &str) {
        let document_id = lock(&self.state)
            .jobs
            .get(job_id)
            .map(|job| job.document_id.clone())
            .unwrap_or_default();

        self.finish(job_id);
        warn!(job_id, error, "job failed");
        self.events.emit(Event::JobFailed {
            job_id: job_id.to_string(),
            document_id,
            error: error.to_string(),
        });
    }

    fn finish(&self, job_id: &str) {
        let callback = {
            let mut state = lock(&self.state);
            state.release(job_id);
            state.take_drained_callback()
        };

        self.available.notify_one();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Put an executing job back at the end of its queue with `retry_count + 1`.
    /// Dependents keep waiting, since the job never leaves the pending set.
    pub fn retry_job(&self, job_id: &str, error: &str) -> JobResult<()> {
        let document_id = {
            let mut state = lock(&self.state);
            let mut job = state
                .release(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

            job.retry_count += 1;
            job.last_error = Some(error.to_string());
            job.error_history.push(error.to_string());
            debug!(job_id, retry = job.retry_count, "retrying job");

            let document_id = job.document_id.clone();
            state.push(job)?;
            document_id
        };

        self.announce(job_id.to_string(), document_id);
        Ok(())
    }

    /// Drop a pending job. Executing jobs are not affected.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = lock(&self.state);
        let mut removed = false;

        state.queues.retain_with_order(|_, queue| {
            let before = queue.len();
            queue.retain(|job| job.id != job_id);
            removed |= queue.len() != before;
            !queue.is_empty()
        });
        if removed {
            state.forget(job_id);
        }
        removed
    }

    pub fn clear(&self, document_id: &str, scope: &str, branch: &str) {
        let mut state = lock(&self.state);
        if let Some(queue) = state.queues.remove(&StreamKey::new(document_id, scope, branch)) {
            for job in queue {
                state.forget(&job.id);
            }
        }
    }

    pub fn clear_all(&self) {
        let mut state = lock(&self.state);
        let queued: Vec<String> = state.queues.values().flatten().map(|job| job.id.clone()).collect();
        for id in queued {
            state.forget(&id);
        }
        state.queues.clear();
    }

    pub fn size(&self, document_id: &str, scope: &str, branch: &str) -> usize {
        lock(&self.state)
            .queues
            .get(&StreamKey::new(document_id, scope, branch))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        lock(&self.state).queues.values().map(VecDeque::len).sum()
    }

    pub fn has_jobs(&self) -> bool {
        self.total_size() > 0
    }

    pub fn is_drained(&self) -> bool {
        lock(&self.state).is_drained()
    }

    /// Stop accepting jobs; `on_drained` runs once nothing is pending or executing
    pub fn block(&self, on_drained: Option<DrainedCallback>) {
        let callback = {
            let mut state = lock(&self.state);
            state.blocked = true;
            state.on_drained = on_drained;
            state.take_drained_callback()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn unblock(&self) {
        let mut state = lock(&self.state);
        state.blocked = false;
        state.on_drained = None;
    }

    pub fn is_blocked(&self) -> bool {
        lock(&self.state).blocked
    }

    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        lock(&self.state).jobs.get(job_id).cloned()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        lock(&self.state).queues.values().flatten().cloned().collect()
    }

    pub fn executing_jobs(&self) -> HashMap<String, HashSet<String>> {
        lock(&self.state).executing.clone()
    }
}
