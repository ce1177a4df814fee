//! Sync manager: owns the remotes of one reactor
//!
//! Written operations are fanned out to the outbox of every remote whose
//! filter matches them. Items arriving in an inbox are applied one at a time
//! per remote through an [`OperationLoader`]; whatever the outcome they leave
//! the inbox, failures going to the dead-letter mailbox.

use hashlink::LinkedHashMap;
use metrics::{counter, gauge};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::channels::{Channel, ChannelFactory};
use super::errors::{ChannelError, ChannelErrorCause, ChannelErrorSource, SyncError, SyncResult};
use super::sync_operation::SyncOperation;
use super::types::{ChannelConfig, RemoteFilter, RemoteOptions, RemoteRecord, RemoteStatus};
use crate::config::SyncConfig;
use crate::core_queue::OperationLoader;
use crate::core_store::{
    CursorStore, OperationStore, OperationWithContext, Ordinal, PagingOptions, RemoteStore,
};
use crate::events::{Event, EventBus, OperationsWritten, Subscription, Topic};
use crate::health::{checks, ComponentHealth};
use crate::lock;
use crate::metrics::{DEAD_LETTERED, INBOX_DEPTH, OUTBOX_DEPTH};

/// A live remote: its persisted record and its channel
pub struct Remote {
    record: RemoteRecord,
    channel: Arc<dyn Channel>,
    token: CancellationToken,
}

impl Remote {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn filter(&self) -> &RemoteFilter {
        &self.record.filter
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Persisted record with the channel's current health
    pub fn record(&self) -> RemoteRecord {
        let mut record = self.record.clone();
        record.status = self.channel.health();
        record
    }
}

pub struct SyncManager {
    remotes: Mutex<LinkedHashMap<String, Arc<Remote>>>,
    remote_store: Arc<dyn RemoteStore>,
    cursor_store: Arc<dyn CursorStore>,
    factory: ChannelFactory,
    store: Arc<dyn OperationStore>,
    loader: Arc<dyn OperationLoader>,
    events: EventBus,
    config: SyncConfig,
    subscription: Mutex<Option<Subscription>>,
    shutdown: CancellationToken,
}

impl SyncManager {
    pub fn new(
        remote_store: Arc<dyn RemoteStore>,
        cursor_store: Arc<dyn CursorStore>,
        factory: ChannelFactory,
        store: Arc<dyn OperationStore>,
        loader: Arc<dyn OperationLoader>,
        events: EventBus,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SyncManager>| {
            let manager = weak.clone();
            let subscription = events.subscribe(Topic::OperationsWritten, move |event| {
                if let (Event::OperationsWritten(written), Some(manager)) = (event, manager.upgrade()) {
                    manager.fan_out(written);
                }
            });

            Self {
                remotes: Mutex::new(LinkedHashMap::new()),
                remote_store,
                cursor_store,
                factory,
                store,
                loader,
                events,
                config,
                subscription: Mutex::new(Some(subscription)),
                shutdown: CancellationToken::new(),
            }
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start a channel for every persisted remote
    #[instrument(skip(self))]
    pub async fn startup(&self) -> SyncResult<()> {
        let records = self.remote_store.list(None).await?;
        let mut started = 0;

        for record in records {
            if lock(&self.remotes).contains_key(&record.name) {
                continue;
            }
            let name = record.name.clone();
            match self.start_remote(record).await {
                Ok(_) => started += 1,
                Err(e) => error!(remote = %name, error = %e, "failed to start remote"),
            }
        }

        info!(started, "sync manager started");
        Ok(())
    }

    /// Stop every channel and persist the remotes' last health
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        lock(&self.subscription).take();

        let remotes: Vec<Arc<Remote>> = lock(&self.remotes).values().cloned().collect();
        for remote in remotes {
            remote.channel.shutdown().await;
            if let Err(e) = self.remote_store.upsert(&remote.record(), None).await {
                warn!(remote = %remote.name(), error = %e, "failed to persist remote status");
            }
        }
        info!("sync manager shut down");
    }

    /// Register a remote with a generated id
    pub async fn add(
        &self,
        name: &str,
        collection_id: &str,
        channel_config: ChannelConfig,
        filter: RemoteFilter,
        options: RemoteOptions,
    ) -> SyncResult<RemoteRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        self.add_with_id(&id, name, collection_id, channel_config, filter, options)
            .await
    }

    /// Register a remote, start its channel and backfill its outbox with
    /// every stored operation it should see
    #[instrument(skip(self, channel_config, filter, options))]
    pub async fn add_with_id(
        &self,
        id: &str,
        name: &str,
        collection_id: &str,
        channel_config: ChannelConfig,
        filter: RemoteFilter,
        options: RemoteOptions,
    ) -> SyncResult<RemoteRecord> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        if lock(&self.remotes).contains_key(name) {
            return Err(SyncError::RemoteExists(name.to_string()));
        }

        let record = RemoteRecord {
            id: id.to_string(),
            name: name.to_string(),
            collection_id: collection_id.to_string(),
            channel_config,
            filter,
            options,
            status: RemoteStatus::default(),
        };
        // Surface configuration errors before anything is persisted.
        self.factory.create(&record)?;
        self.remote_store.upsert(&record, None).await?;

        let remote = self.start_remote(record).await?;
        info!(remote = %name, kind = remote.record.channel_config.kind(), "remote added");
        Ok(remote.record())
    }

    pub async fn remove(&self, name: &str) -> SyncResult<()> {
        let remote = lock(&self.remotes)
            .remove(name)
            .ok_or_else(|| SyncError::RemoteNotFound(name.to_string()))?;

        remote.token.cancel();
        remote.channel.shutdown().await;
        self.remote_store.remove(name, None).await?;
        self.cursor_store.remove(name, None).await?;

        info!(remote = %name, "remote removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<RemoteRecord> {
        lock(&self.remotes).values().map(|remote| remote.record()).collect()
    }

    pub fn get_by_name(&self, name: &str) -> SyncResult<Arc<Remote>> {
        lock(&self.remotes)
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::RemoteNotFound(name.to_string()))
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Remote>> {
        lock(&self.remotes).values().find(|remote| remote.id() == id).cloned()
    }

    /// Reset a remote's failure counters and resume its channel
    pub fn retry(&self, name: &str) -> SyncResult<()> {
        self.get_by_name(name)?.channel.retry();
        Ok(())
    }

    /// One push and one pull component per remote
    pub fn health(&self) -> Vec<ComponentHealth> {
        let max_failures = self.config.max_failures;
        lock(&self.remotes)
            .values()
            .flat_map(|remote| {
                let max = match &remote.record.channel_config {
                    ChannelConfig::Polling { max_failures, .. } => *max_failures,
                    _ => max_failures,
                };
                let status = remote.channel.health();
                [
                    checks::check_channel(&format!("{}.push", remote.name()), &status.push, max),
                    checks::check_channel(&format!("{}.pull", remote.name()), &status.pull, max),
                ]
            })
            .collect()
    }

    async fn start_remote(&self, record: RemoteRecord) -> SyncResult<Arc<Remote>> {
        let channel = self.factory.create(&record)?;
        let token = self.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        self.wire(&channel, tx);
        let remote = Arc::new(Remote {
            record,
            channel: channel.clone(),
            token: token.clone(),
        });

        {
            let mut remotes = lock(&self.remotes);
            if remotes.contains_key(remote.name()) {
                return Err(SyncError::RemoteExists(remote.name().to_string()));
            }
            remotes.insert(remote.name().to_string(), remote.clone());
        }

        if let Err(e) = channel.init().await {
            lock(&self.remotes).remove(remote.name());
            channel.shutdown().await;
            return Err(e);
        }

        tokio::spawn(run_inbox_worker(
            Arc::downgrade(&channel),
            self.loader.clone(),
            rx,
            token,
        ));

        let from = channel.outbox().ack_ordinal();
        let backfilled = self.backfill(&remote, from).await?;
        debug!(remote = %remote.name(), from, backfilled, "outbox backfilled");
        Ok(remote)
    }

    /// Hook the channel's mailboxes up to the inbox worker and the event bus
    fn wire(&self, channel: &Arc<dyn Channel>, tx: mpsc::UnboundedSender<Arc<SyncOperation>>) {
        let events = self.events.clone();
        channel.inbox().on_added(Arc::new(move |items: &[Arc<SyncOperation>]| {
            for item in items {
                watch_status(&events, item);
                if tx.send(item.clone()).is_err() {
                    debug!(sync_operation = %item.id, "inbox worker gone");
                }
            }
        }));

        let events = self.events.clone();
        channel.dead_letter().on_added(Arc::new(move |items: &[Arc<SyncOperation>]| {
            for item in items {
                counter!(DEAD_LETTERED).increment(1);
                events.emit(Event::SyncDeadLetter {
                    sync_operation_id: item.id.clone(),
                    remote_name: item.remote_name.clone(),
                    document_id: item.document_id.clone(),
                    error: item.error().map(|e| e.to_string()).unwrap_or_default(),
                });
            }
        }));
    }

    /// Queue freshly written operations for every interested remote
    fn fan_out(&self, written: &OperationsWritten) {
        if self.is_shut_down() {
            return;
        }

        let remotes: Vec<Arc<Remote>> = lock(&self.remotes).values().cloned().collect();
        for remote in remotes {
            if !written.reshuffled && written.source_remote.as_deref() == Some(remote.name()) {
                continue;
            }

            let items: Vec<OperationWithContext> = written
                .operations
                .iter()
                .filter(|item| remote.filter().matches(&item.context))
                .cloned()
                .collect();
            if items.is_empty() {
                continue;
            }

            let sync_ops: Vec<Arc<SyncOperation>> = batch_by_stream(items)
                .into_iter()
                .map(|batch| {
                    let sync_op = SyncOperation::new(remote.name(), &written.document_id, &written.branch, batch)
                        .with_job(&written.job_id, written.job_dependencies.clone());
                    watch_status(&self.events, &sync_op);
                    Arc::new(sync_op)
                })
                .collect();

            debug!(remote = %remote.name(), document_id = %written.document_id, batches = sync_ops.len(), "fan out");
            remote.channel.outbox().add(sync_ops);
            gauge!(OUTBOX_DEPTH, "remote" => remote.name().to_string()).set(remote.channel.outbox().len() as f64);
        }
    }

    /// Add every stored operation above `from` that the remote should see
    async fn backfill(&self, remote: &Remote, from: Ordinal) -> SyncResult<usize> {
        let since = remote.record.options.since_timestamp_utc_ms;
        let batch_size = self.config.backfill_batch_size.max(1);
        let mut cursor = from;
        let mut total = 0;

        loop {
            let page = self
                .store
                .get_since_id(from, Some(&PagingOptions::after(cursor, batch_size)), None)
                .await?;

            let items: Vec<OperationWithContext> = page
                .results
                .into_iter()
                .filter(|item| remote.filter().matches(&item.context))
                .filter(|item| since.map_or(true, |since| item.operation.timestamp_utc_ms > since))
                .collect();

            if !items.is_empty() {
                total += items.len();
                let sync_ops: Vec<Arc<SyncOperation>> = batch_by_stream(items)
                    .into_iter()
                    .map(|batch| {
                        let document_id = batch[0].context.document_id.clone();
                        let branch = batch[0].context.branch.clone();
                        let sync_op = SyncOperation::new(remote.name(), document_id, branch, batch);
                        watch_status(&self.events, &sync_op);
                        Arc::new(sync_op)
                    })
                    .collect();
                remote.channel.outbox().add(sync_ops);
            }

            match page.next_cursor {
                Some(next) if next > cursor => cursor = next,
                _ => break,
            }
        }
        Ok(total)
    }
}

/// Group consecutive operations of the same stream, keeping their order
fn batch_by_stream(items: Vec<OperationWithContext>) -> Vec<Vec<OperationWithContext>> {
    let mut batches: Vec<Vec<OperationWithContext>> = Vec::new();
    for item in items {
        match batches.last_mut() {
            Some(batch) if batch[0].context.stream() == item.context.stream() => batch.push(item),
            _ => batches.push(vec![item]),
        }
    }
    batches
}

fn watch_status(events: &EventBus, sync_op: &SyncOperation) {
    let events = events.clone();
    sync_op.on(move |sync_op, previous, status| {
        events.emit(Event::SyncStatusChanged {
            sync_operation_id: sync_op.id.clone(),
            remote_name: sync_op.remote_name.clone(),
            document_id: sync_op.document_id.clone(),
            previous,
            status,
        });
    });
}

async fn run_inbox_worker(
    channel: Weak<dyn Channel>,
    loader: Arc<dyn OperationLoader>,
    mut rx: mpsc::UnboundedReceiver<Arc<SyncOperation>>,
    token: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let channel = match channel.upgrade() {
            Some(channel) => channel,
            None => break,
        };
        apply_inbox_item(channel.as_ref(), loader.as_ref(), item, &token).await;
    }
}

/// Load one received batch; the item leaves the inbox either way
async fn apply_inbox_item(
    channel: &dyn Channel,
    loader: &dyn OperationLoader,
    item: Arc<SyncOperation>,
    token: &CancellationToken,
) {
    if channel.inbox().get(&item.id).is_none() {
        return;
    }

    let result = loader
        .load(
            &item.document_id,
            &item.branch,
            item.operations.clone(),
            channel.remote_name(),
            Some(token),
        )
        .await;

    let failure = match result {
        Ok(infos) => infos.iter().find_map(|info| info.error().map(str::to_string)),
        Err(e) => Some(e.to_string()),
    };

    if token.is_cancelled() {
        // Shutting down: leave the item for the next start.
        return;
    }

    match failure {
        None => {
            item.executed();
        }
        Some(error) => {
            warn!(remote = %channel.remote_name(), sync_operation = %item.id, %error, "failed to apply received operations");
            item.failed(ChannelError::new(ChannelErrorSource::Inbox, ChannelErrorCause::Apply(error)));
            channel.dead_letter().add(vec![item.clone()]);
        }
    }

    channel.inbox().remove(&[item]);
    gauge!(INBOX_DEPTH, "remote" => channel.remote_name().to_string()).set(channel.inbox().len() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_queue::{JobError, JobInfo, JobResult};
    use crate::core_store::{
        AbortSignal, CursorType, Database, OperationContext, SqlCursorStore, SqlOperationStore, SqlRemoteStore,
        SyncCursor,
    };
    use crate::core_sync::channels::ChannelRegistry;
    use crate::core_sync::envelope::SyncEnvelope;
    use crate::core_sync::transport::TransportRegistry;
    use crate::core_sync::SyncOperationStatus;
    use crate::test_utils::fixtures::make_operation;
    use crate::test_utils::{wait_until, DEFAULT_TEST_TIMEOUT};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeLoader {
        fail: AtomicBool,
        loaded: Mutex<Vec<(String, usize, String)>>,
    }

    #[async_trait]
    impl OperationLoader for FakeLoader {
        async fn load(
            &self,
            document_id: &str,
            _branch: &str,
            operations: Vec<OperationWithContext>,
            source_remote: &str,
            _signal: Option<&AbortSignal>,
        ) -> JobResult<Vec<JobInfo>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(JobError::Invalid("refused".into()));
            }
            self.loaded
                .lock()
                .unwrap()
                .push((document_id.to_string(), operations.len(), source_remote.to_string()));
            Ok(Vec::new())
        }
    }

    struct Harness {
        manager: Arc<SyncManager>,
        loader: Arc<FakeLoader>,
        events: EventBus,
        cursors: Arc<dyn CursorStore>,
    }

    fn harness() -> Harness {
        let db = Database::memory().unwrap();
        let cursors: Arc<dyn CursorStore> = Arc::new(SqlCursorStore::new(db.clone()));
        let factory = ChannelFactory::new(
            ChannelRegistry::new(),
            TransportRegistry::new(),
            cursors.clone(),
            SyncConfig::default(),
        );
        let loader = Arc::new(FakeLoader::default());
        let events = EventBus::new();
        let manager = SyncManager::new(
            Arc::new(SqlRemoteStore::new(db.clone())),
            cursors.clone(),
            factory,
            Arc::new(SqlOperationStore::new(db)),
            loader.clone(),
            events.clone(),
            SyncConfig::default(),
        );
        Harness {
            manager,
            loader,
            events,
            cursors,
        }
    }

    fn item(document_id: &str, scope: &str, action_id: &str, ordinal: u64) -> OperationWithContext {
        OperationWithContext {
            operation: make_operation(0, action_id, ordinal),
            context: OperationContext {
                document_id: document_id.into(),
                document_type: "counter".into(),
                scope: scope.into(),
                branch: "main".into(),
                ordinal,
            },
        }
    }

    fn written(operations: Vec<OperationWithContext>, source_remote: Option<&str>) -> Event {
        Event::OperationsWritten(OperationsWritten {
            job_id: "job".into(),
            job_dependencies: vec![],
            document_id: operations[0].context.document_id.clone(),
            branch: "main".into(),
            operations,
            source_remote: source_remote.map(str::to_string),
            reshuffled: false,
        })
    }

    async fn add_polled(h: &Harness, name: &str, filter: RemoteFilter) {
        h.manager
            .add(name, "drive", ChannelConfig::Polled, filter, RemoteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let h = harness();
        add_polled(&h, "a", RemoteFilter::default()).await;

        assert!(matches!(
            h.manager
                .add("a", "drive", ChannelConfig::Polled, RemoteFilter::default(), RemoteOptions::default())
                .await,
            Err(SyncError::RemoteExists(_))
        ));
        assert_eq!(h.manager.list().len(), 1);
        let id = h.manager.get_by_name("a").unwrap().id().to_string();
        assert!(h.manager.get_by_id(&id).is_some());

        h.cursors.upsert(&SyncCursor::new("a", CursorType::Inbox, 3), None).await.unwrap();
        h.manager.remove("a").await.unwrap();
        assert!(h.manager.list().is_empty());
        assert!(h.cursors.list("a", None).await.unwrap().is_empty());
        assert!(matches!(h.manager.remove("a").await, Err(SyncError::RemoteNotFound(_))));
    }

    #[tokio::test]
    async fn test_fan_out_honours_filter_and_source() {
        let h = harness();
        add_polled(&h, "all", RemoteFilter::default()).await;
        add_polled(
            &h,
            "d2-only",
            RemoteFilter {
                document_id: vec!["d2".into()],
                ..RemoteFilter::default()
            },
        )
        .await;

        h.events.emit(written(vec![item("d1", "global", "a", 1), item("d1", "global", "b", 2)], None));
        h.events.emit(written(vec![item("d2", "global", "c", 3)], Some("all")));

        let all = h.manager.get_by_name("all").unwrap();
        let outbox = all.channel().outbox().items();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].operations.len(), 2);
        assert_eq!(outbox[0].job_id, "job");

        let d2 = h.manager.get_by_name("d2-only").unwrap();
        assert_eq!(d2.channel().outbox().len(), 1);
        assert_eq!(d2.channel().outbox().items()[0].document_id, "d2");
    }

    #[tokio::test]
    async fn test_inbox_items_are_loaded_and_removed() {
        let h = harness();
        add_polled(&h, "peer", RemoteFilter::default()).await;
        let remote = h.manager.get_by_name("peer").unwrap();

        remote
            .channel()
            .receive(SyncEnvelope::operations("x", vec![item("d1", "global", "a", 4)]))
            .unwrap();
        let item = remote.channel().inbox().items()[0].clone();

        let channel = remote.channel().clone();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            let channel = channel.clone();
            async move { channel.inbox().is_empty() }
        })
        .await);
        assert_eq!(item.status(), SyncOperationStatus::Applied);
        assert_eq!(*h.loader.loaded.lock().unwrap(), vec![("d1".to_string(), 1, "peer".to_string())]);
        assert_eq!(remote.channel().inbox().ack_ordinal(), 4);
    }

    #[tokio::test]
    async fn test_failed_load_is_dead_lettered() {
        let h = harness();
        h.loader.fail.store(true, Ordering::SeqCst);
        add_polled(&h, "peer", RemoteFilter::default()).await;

        let dead = Arc::new(Mutex::new(Vec::new()));
        let sink = dead.clone();
        let _sub = h.events.subscribe(Topic::SyncDeadLetter, move |event| {
            if let Event::SyncDeadLetter { error, .. } = event {
                sink.lock().unwrap().push(error.clone());
            }
        });

        let remote = h.manager.get_by_name("peer").unwrap();
        remote
            .channel()
            .receive(SyncEnvelope::operations("x", vec![item("d1", "global", "a", 1)]))
            .unwrap();

        let channel = remote.channel().clone();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            let channel = channel.clone();
            async move { channel.dead_letter().len() == 1 }
        })
        .await);
        assert!(remote.channel().inbox().is_empty());
        assert!(dead.lock().unwrap()[0].contains("refused"));
    }

    #[tokio::test]
    async fn test_status_changes_are_published() {
        let h = harness();
        add_polled(&h, "peer", RemoteFilter::default()).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.events.subscribe(Topic::SyncStatusChanged, move |event| {
            if let Event::SyncStatusChanged { status, .. } = event {
                sink.lock().unwrap().push(*status);
            }
        });

        h.events.emit(written(vec![item("d1", "global", "a", 1)], None));
        let remote = h.manager.get_by_name("peer").unwrap();
        remote.channel().update_cursor(1).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![SyncOperationStatus::Applied]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_remotes() {
        let h = harness();
        add_polled(&h, "peer", RemoteFilter::default()).await;
        h.manager.shutdown().await;
        h.manager.shutdown().await;

        assert!(matches!(
            h.manager
                .add("other", "drive", ChannelConfig::Polled, RemoteFilter::default(), RemoteOptions::default())
                .await,
            Err(SyncError::ShutDown)
        ));
        assert_eq!(h.manager.health().len(), 2);
    }

    #[test]
    fn test_batch_by_stream_keeps_runs() {
        let batches = batch_by_stream(vec![
            item("d1", "global", "a", 1),
            item("d1", "global", "b", 2),
            item("d1", "local", "c", 3),
            item("d1", "global", "d", 4),
        ]);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }
}
