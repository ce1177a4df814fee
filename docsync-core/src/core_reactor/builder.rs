//! Reactor construction

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::errors::ReactorResult;
use super::reactor::Reactor;
use crate::config::Config;
use crate::core_model::{DocumentModel, ModelRegistry};
use crate::core_queue::{ExecutorConfig, InMemoryQueue, JobClient, JobExecutor, JobTracker, OperationLoader};
use crate::core_store::{
    CursorStore, Database, OperationStore, RemoteStore, SqlCursorStore, SqlKeyframeStore, SqlOperationStore,
    SqlRemoteStore,
};
use crate::core_sync::{ChannelFactory, ChannelRegistry, SyncManager, SyncService, TransportRegistry};
use crate::core_view::DocumentView;
use crate::events::EventBus;
use crate::health::HealthChecker;

/// Builder for a [`Reactor`]
pub struct ReactorBuilder {
    config: Config,
    models: ModelRegistry,
    database: Option<Database>,
    events: Option<EventBus>,
    sync: Option<(ChannelRegistry, TransportRegistry)>,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            models: ModelRegistry::new(),
            database: None,
            events: None,
            sync: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a document model
    pub fn with_model(mut self, model: Arc<dyn DocumentModel>) -> Self {
        self.models.register(model);
        self
    }

    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    /// Use an already opened database instead of `storage.database_path`
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Enable sync. Internal channels find their peers in `channels`,
    /// polling channels their transport in `transports`.
    pub fn with_sync(mut self, channels: ChannelRegistry, transports: TransportRegistry) -> Self {
        self.sync = Some((channels, transports));
        self
    }

    /// Open storage, start the job workers and, with sync enabled, every
    /// persisted remote
    pub async fn build(self) -> ReactorResult<Reactor> {
        let config = self.config;
        config.validate()?;

        if config.metrics.enabled {
            crate::metrics::init_metrics();
        }

        let db = match self.database {
            Some(db) => db,
            None => Database::open(&config.storage.database_path, config.storage.pool_size)?,
        };

        let store: Arc<dyn OperationStore> = Arc::new(SqlOperationStore::new(db.clone()));
        let keyframes = Arc::new(SqlKeyframeStore::new(db.clone()));
        let view = Arc::new(DocumentView::new(
            db.clone(),
            store.clone(),
            config.storage.meta_cache_capacity,
        ));
        let indexed = view.init(None).await?;

        let events = self.events.unwrap_or_default();
        let queue = Arc::new(InMemoryQueue::new(events.clone()));
        let tracker = Arc::new(JobTracker::new());
        let client = JobClient::new(queue.clone(), tracker.clone());

        let executor = Arc::new(JobExecutor::new(
            queue.clone(),
            tracker,
            store.clone(),
            keyframes,
            view.clone(),
            self.models.clone(),
            events.clone(),
            ExecutorConfig::from(&config),
        ));
        let shutdown = CancellationToken::new();
        let workers = executor.start(config.queue.worker_count, shutdown.child_token());

        let (sync, service) = match self.sync {
            Some((channels, transports)) => {
                let cursor_store: Arc<dyn CursorStore> = Arc::new(SqlCursorStore::new(db.clone()));
                let remote_store: Arc<dyn RemoteStore> = Arc::new(SqlRemoteStore::new(db.clone()));
                let factory = ChannelFactory::new(channels, transports, cursor_store.clone(), config.sync.clone());
                let loader: Arc<dyn OperationLoader> = Arc::new(client.clone());

                let manager = SyncManager::new(
                    remote_store,
                    cursor_store,
                    factory,
                    store.clone(),
                    loader,
                    events.clone(),
                    config.sync.clone(),
                );
                manager.startup().await?;
                let service = Arc::new(SyncService::new(manager.clone(), self.models.clone()));
                (Some(manager), Some(service))
            }
            None => (None, None),
        };

        info!(
            workers = config.queue.worker_count,
            indexed,
            sync = sync.is_some(),
            "reactor started"
        );

        Ok(Reactor {
            config,
            models: self.models,
            store,
            view,
            events,
            queue,
            client,
            workers: Mutex::new(workers),
            shutdown,
            sync,
            service,
            health: HealthChecker::new(env!("CARGO_PKG_VERSION")),
        })
    }
}
