//! Job executor
//!
//! Workers pull jobs from the queue and turn them into operations. A mutate
//! job reduces local actions at the head of each stream. A load job merges
//! operations received from a remote: local operations at or after the
//! earliest incoming timestamp are re-appended together with the incoming
//! ones in timestamp order, superseding the old entries through `skip`.

use metrics::counter;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{JobError, JobResult};
use super::job::{Job, JobKind};
use super::queue::InMemoryQueue;
use super::tracker::JobTracker;
use crate::config::Config;
use crate::core_model::{
    derive_operation_id, derive_reshuffled_id, garbage_collect, hash_state, is_deleted, reshuffle_by_timestamp,
    sort_operations, IndexPosition, ModelError, ModelRegistry, CREATE_DOCUMENT,
};
use crate::core_store::{
    read_stream, write_all, AbortSignal, Action, KeyframeStore, Operation, OperationStore, OperationWithContext,
    PagingOptions, StoreError, StreamKey, DOCUMENT_SCOPE,
};
use crate::core_view::DocumentView;
use crate::events::{Event, EventBus, OperationsWritten};
use crate::metrics::{Timer, JOBS_COMPLETED, JOBS_FAILED, JOB_DURATION_MS, RESHUFFLES};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Write a keyframe every N revisions; 0 disables keyframes
    pub keyframe_interval: u64,
    /// Most local operations a load may reorder
    pub max_skip_threshold: usize,
    /// Retries for jobs failing with a revision mismatch
    pub max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: 10,
            max_skip_threshold: 1000,
            max_retries: 0,
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            keyframe_interval: config.storage.keyframe_interval,
            max_skip_threshold: config.queue.max_skip_threshold,
            max_retries: config.queue.max_retries,
        }
    }
}

/// Operations written by one job
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub operations: Vec<OperationWithContext>,
    /// The write superseded local operations
    pub reshuffled: bool,
}

/// Loaded view of one stream
struct StreamState {
    key: StreamKey,
    /// Every stored entry, superseded ones included
    log: Vec<Operation>,
    /// Index the next operation takes
    head: u64,
    /// Sorted, garbage-collected log
    effective: Vec<Operation>,
    /// Leading effective entries that sit at their own position
    stable: usize,
    /// Scope state after the last effective operation
    state: Value,
    last_op_id: Option<String>,
    pending: Vec<Operation>,
}

impl StreamState {
    fn fully_stable(&self) -> bool {
        self.stable == self.effective.len()
    }
}

fn stable_prefix(effective: &[Operation]) -> usize {
    effective
        .iter()
        .enumerate()
        .take_while(|(position, op)| op.index == *position as u64)
        .count()
}

pub struct JobExecutor {
    queue: Arc<InMemoryQueue>,
    tracker: Arc<JobTracker>,
    store: Arc<dyn OperationStore>,
    keyframes: Arc<dyn KeyframeStore>,
    view: Arc<DocumentView>,
    models: ModelRegistry,
    events: EventBus,
    config: ExecutorConfig,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<InMemoryQueue>,
        tracker: Arc<JobTracker>,
        store: Arc<dyn OperationStore>,
        keyframes: Arc<dyn KeyframeStore>,
        view: Arc<DocumentView>,
        models: ModelRegistry,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            store,
            keyframes,
            view,
            models,
            events,
            config,
        }
    }

    /// Spawn `workers` tasks draining the queue until `shutdown` fires
    pub fn start(self: &Arc<Self>, workers: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let executor = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { executor.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "job worker started");

        loop {
            match self.queue.dequeue_next(Some(&shutdown)) {
                Ok(Some(job)) => self.run_job(job, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work() => {}
                    }
                }
                Err(_) => break,
            }
        }

        debug!(worker, "job worker stopped");
    }

    async fn run_job(&self, job: Job, signal: &AbortSignal) {
        self.tracker.running(&job.id);
        self.events.emit(Event::JobRunning {
            job_id: job.id.clone(),
            document_id: job.document_id.clone(),
        });

        let timer = Timer::new(JOB_DURATION_MS);
        let result = self.execute(&job, Some(signal)).await;
        let elapsed_ms = timer.stop();

        match result {
            Ok(outcome) => {
                let operation_count = outcome.operations.len();
                if !outcome.operations.is_empty() {
                    let source_remote = if outcome.reshuffled {
                        None
                    } else {
                        job.source_remote().map(str::to_string)
                    };
                    self.events.emit(Event::OperationsWritten(OperationsWritten {
                        job_id: job.id.clone(),
                        job_dependencies: job.queue_hint.clone(),
                        document_id: job.document_id.clone(),
                        branch: job.branch.clone(),
                        operations: outcome.operations.clone(),
                        source_remote,
                        reshuffled: outcome.reshuffled,
                    }));
                }

                self.tracker.completed(&job.id, outcome.operations);
                self.queue.complete_job(&job.id);
                counter!(JOBS_COMPLETED).increment(1);
                debug!(job_id = %job.id, document_id = %job.document_id, operation_count, elapsed_ms, "job completed");

                self.events.emit(Event::JobCompleted {
                    job_id: job.id,
                    document_id: job.document_id,
                    operation_count,
                });
            }
            Err(e) if e.is_retryable() && job.retry_count < self.config.max_retries => {
                warn!(job_id = %job.id, retry = job.retry_count + 1, error = %e, "retrying job");
                if let Err(retry_error) = self.queue.retry_job(&job.id, &e.to_string()) {
                    self.fail(&job, &retry_error.to_string());
                }
            }
            Err(e) => {
                error!(job_id = %job.id, document_id = %job.document_id, error = %e, "job failed");
                self.fail(&job, &e.to_string());
            }
        }
    }

    fn fail(&self, job: &Job, error: &str) {
        counter!(JOBS_FAILED).increment(1);
        self.tracker.failed(&job.id, error);
        self.queue.fail_job(&job.id, error);
    }

    /// Run a job without any queue bookkeeping
    pub async fn execute(&self, job: &Job, signal: Option<&AbortSignal>) -> JobResult<JobOutcome> {
        match &job.kind {
            JobKind::Mutate { actions, document_type } => {
                self.execute_mutate(job, actions, document_type.as_deref(), signal).await
            }
            JobKind::Load {
                operations,
                document_type,
                ..
            } => self.execute_load(job, operations, document_type, signal).await,
        }
    }

    async fn load_stream(
        &self,
        key: StreamKey,
        document_type: &str,
        signal: Option<&AbortSignal>,
    ) -> JobResult<StreamState> {
        let operations = read_stream(self.store.as_ref(), &key, signal).await?;
        let head = operations.last().map(|op| op.index + 1).unwrap_or(0);
        let last_op_id = operations.last().map(|op| op.id.clone());
        let effective = garbage_collect(&sort_operations(&operations));
        let stable = stable_prefix(&effective);
        let state = self
            .state_at(&key, document_type, &effective, stable, effective.len(), signal)
            .await?;

        Ok(StreamState {
            key,
            log: operations,
            head,
            effective,
            stable,
            state,
            last_op_id,
            pending: Vec::new(),
        })
    }

    /// Scope state after the first `position` effective operations
    async fn state_at(
        &self,
        key: &StreamKey,
        document_type: &str,
        effective: &[Operation],
        stable: usize,
        position: usize,
        signal: Option<&AbortSignal>,
    ) -> JobResult<Value> {
        if position == 0 {
            return Ok(self.models.initial_state(document_type, &key.scope)?);
        }
        if let Some(state) = &effective[position - 1].resulting_state {
            return Ok(state.clone());
        }

        let target = stable.min(position) as u64;
        let (mut state, from) = match self.keyframes.find_nearest_keyframe(key, target, signal).await? {
            Some(keyframe) => (keyframe.document, keyframe.revision as usize),
            None => (self.models.initial_state(document_type, &key.scope)?, 0),
        };

        debug!(stream = %key, from, position, "replaying operations");
        for op in &effective[from..position] {
            state = self.models.reduce(document_type, &key.scope, &state, &op.action)?;
        }
        Ok(state)
    }

    async fn execute_mutate(
        &self,
        job: &Job,
        actions: &[Action],
        document_type: Option<&str>,
        signal: Option<&AbortSignal>,
    ) -> JobResult<JobOutcome> {
        if actions.is_empty() {
            return Err(JobError::Invalid(format!("job {} has no actions", job.id)));
        }

        let document_type = match document_type {
            Some(document_type) => document_type.to_string(),
            None => self.store.get_document_type(&job.document_id, signal).await?,
        };

        let mut streams: BTreeMap<String, StreamState> = BTreeMap::new();
        let document_key = StreamKey::new(&job.document_id, DOCUMENT_SCOPE, &job.branch);
        streams.insert(
            DOCUMENT_SCOPE.to_string(),
            self.load_stream(document_key, &document_type, signal).await?,
        );

        for action in actions {
            if !streams.contains_key(&action.scope) {
                let key = StreamKey::new(&job.document_id, &action.scope, &job.branch);
                let stream = self.load_stream(key, &document_type, signal).await?;
                streams.insert(action.scope.clone(), stream);
            }

            if let Some(document) = streams.get(DOCUMENT_SCOPE) {
                if is_deleted(&document.state) {
                    return Err(ModelError::DocumentDeleted(job.document_id.clone()).into());
                }
                if action.scope != DOCUMENT_SCOPE && document.head == 0 && document.pending.is_empty() {
                    return Err(StoreError::NotFound(job.document_id.clone()).into());
                }
            }

            let stream = streams
                .get_mut(&action.scope)
                .ok_or_else(|| JobError::Invalid(format!("unknown scope {}", action.scope)))?;

            if action.action_type == CREATE_DOCUMENT && stream.head != 0 {
                return Err(ModelError::rejected(&action.id, format!("document {} already exists", job.document_id)).into());
            }

            let state = self
                .models
                .reduce(&document_type, &action.scope, &stream.state, action)?;
            let id = derive_operation_id(&job.document_id, &action.scope, &job.branch, &action.id);

            stream.pending.push(Operation {
                id: id.clone(),
                index: stream.head,
                skip: 0,
                hash: hash_state(&state),
                timestamp_utc_ms: action.timestamp_utc_ms,
                action: action.clone(),
                prev_op_id: stream.last_op_id.replace(id),
                resulting_state: Some(state.clone()),
                error: None,
            });
            stream.head += 1;
            stream.state = state;
        }

        // The document scope goes first so a creation lands before its content.
        let order: Vec<String> = std::iter::once(DOCUMENT_SCOPE.to_string())
            .chain(streams.keys().filter(|scope| *scope != DOCUMENT_SCOPE).cloned())
            .collect();

        let mut written = Vec::new();
        for scope in order {
            let Some(stream) = streams.get_mut(&scope) else {
                continue;
            };
            if stream.pending.is_empty() {
                continue;
            }
            let operations = std::mem::take(&mut stream.pending);
            let expected = operations[0].index;
            let applied = self
                .store
                .apply(&stream.key, &document_type, expected, write_all(operations), signal)
                .await?;

            if stream.fully_stable() {
                self.write_keyframes(&stream.key, &document_type, &applied, signal).await?;
            }
            written.extend(applied);
        }

        self.finish_write(&job.document_id, &streams, &written, signal).await?;
        Ok(JobOutcome {
            operations: written,
            reshuffled: false,
        })
    }

    async fn execute_load(
        &self,
        job: &Job,
        operations: &[Operation],
        document_type: &str,
        signal: Option<&AbortSignal>,
    ) -> JobResult<JobOutcome> {
        let key = StreamKey::new(&job.document_id, &job.scope, &job.branch);

        for op in operations {
            if op.action.scope != job.scope {
                return Err(JobError::Invalid(format!(
                    "operation {} belongs to scope {}, not {}",
                    op.id, op.action.scope, job.scope
                )));
            }
            self.models.validate(document_type, &op.action)?;
        }

        let mut stream = self.load_stream(key.clone(), document_type, signal).await?;
        let known_actions: HashSet<&str> = stream.log.iter().map(|op| op.action.id.as_str()).collect();
        let mut existing_ids: HashSet<String> = stream.log.iter().map(|op| op.id.clone()).collect();

        let mut seen = HashSet::new();
        let mut incoming: Vec<Operation> = operations
            .iter()
            .filter(|op| !known_actions.contains(op.action.id.as_str()) && seen.insert(op.action.id.clone()))
            .cloned()
            .collect();
        if incoming.is_empty() {
            debug!(stream = %key, "nothing new to load");
            return Ok(JobOutcome::default());
        }
        incoming.sort_by_key(|op| (op.index, op.skip));

        let min_timestamp = incoming.iter().map(|op| op.timestamp_utc_ms).min().unwrap_or(0);
        let conflicting = self
            .store
            .get_conflicting(
                &key,
                min_timestamp,
                Some(&PagingOptions::limit(self.config.max_skip_threshold + 1)),
                signal,
            )
            .await?;
        if conflicting.results.len() > self.config.max_skip_threshold {
            return Err(JobError::SkipThresholdExceeded {
                document_id: job.document_id.clone(),
                threshold: self.config.max_skip_threshold,
            });
        }

        let position = stream
            .effective
            .iter()
            .position(|op| op.timestamp_utc_ms >= min_timestamp)
            .unwrap_or(stream.effective.len());
        let local_tail = &stream.effective[position..];

        // Supersede every entry from the first reordered one up to the head.
        let skip = local_tail
            .first()
            .map(|first| stream.head - first.index.saturating_sub(first.skip))
            .unwrap_or(0);
        let start = IndexPosition::new(stream.head, skip);
        let mut merged = reshuffle_by_timestamp(start, local_tail, &incoming);

        let mut state = self
            .state_at(&key, document_type, &stream.effective, stream.stable, position, signal)
            .await?;

        for op in merged.iter_mut() {
            while existing_ids.contains(&op.id) {
                op.id = derive_reshuffled_id(&op.id, op.index);
            }
            existing_ids.insert(op.id.clone());

            state = self.models.reduce(document_type, &key.scope, &state, &op.action)?;
            op.hash = hash_state(&state);
            op.resulting_state = Some(state.clone());
            op.prev_op_id = stream.last_op_id.replace(op.id.clone());
            op.error = None;
        }

        if skip > 0 {
            counter!(RESHUFFLES).increment(1);
            info!(stream = %key, reordered = local_tail.len(), incoming = incoming.len(), skip, "reshuffling stream");
        }

        let applied = self
            .store
            .apply(&key, document_type, stream.head, write_all(merged), signal)
            .await?;

        if skip == 0 && stream.fully_stable() {
            self.write_keyframes(&key, document_type, &applied, signal).await?;
        }

        stream.state = state;
        let mut streams = BTreeMap::new();
        streams.insert(key.scope.clone(), stream);
        self.finish_write(&job.document_id, &streams, &applied, signal).await?;

        Ok(JobOutcome {
            operations: applied,
            reshuffled: skip > 0,
        })
    }

    async fn write_keyframes(
        &self,
        key: &StreamKey,
        document_type: &str,
        written: &[OperationWithContext],
        signal: Option<&AbortSignal>,
    ) -> JobResult<()> {
        let interval = self.config.keyframe_interval;
        if interval == 0 {
            return Ok(());
        }

        for item in written {
            let revision = item.operation.index + 1;
            if revision % interval != 0 {
                continue;
            }
            if let Some(state) = &item.operation.resulting_state {
                self.keyframes
                    .put_keyframe(key, revision, document_type, state, signal)
                    .await?;
                debug!(stream = %key, revision, "keyframe written");
            }
        }
        Ok(())
    }

    /// Index the write and drop keyframes of a document that was deleted
    async fn finish_write(
        &self,
        document_id: &str,
        streams: &BTreeMap<String, StreamState>,
        written: &[OperationWithContext],
        signal: Option<&AbortSignal>,
    ) -> JobResult<()> {
        self.view.index_operations(written, signal).await?;

        let deleted = streams
            .get(DOCUMENT_SCOPE)
            .map(|document| is_deleted(&document.state))
            .unwrap_or(false);
        if deleted {
            let removed = self.keyframes.delete_keyframes(document_id, None, None, signal).await?;
            info!(document_id, removed, "document deleted");
        }
        Ok(())
    }
}
