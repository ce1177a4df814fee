//! Reactor facade
//!
//! Writes are queued as jobs and return immediately with the job's initial
//! status; use [`Reactor::wait_for_job`] to observe the outcome. Reads go
//! straight to the document view.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::errors::{ReactorError, ReactorResult};
use crate::config::Config;
use crate::core_model::{create_document_action, delete_document_action, ModelError, ModelRegistry};
use crate::core_queue::{InMemoryQueue, JobClient, JobInfo};
use crate::core_store::{
    AbortSignal, Action, Operation, OperationStore, OperationWithContext, Ordinal, PagedResults, PagingOptions,
    ViewFilter, DEFAULT_BRANCH,
};
use crate::core_sync::{SyncManager, SyncService};
use crate::core_view::{Document, DocumentView};
use crate::events::EventBus;
use crate::health::{checks, HealthCheck, HealthChecker};
use crate::lock;

pub struct Reactor {
    pub(super) config: Config,
    pub(super) models: ModelRegistry,
    pub(super) store: Arc<dyn OperationStore>,
    pub(super) view: Arc<DocumentView>,
    pub(super) events: EventBus,
    pub(super) queue: Arc<InMemoryQueue>,
    pub(super) client: JobClient,
    pub(super) workers: Mutex<Vec<JoinHandle<()>>>,
    pub(super) shutdown: CancellationToken,
    pub(super) sync: Option<Arc<SyncManager>>,
    pub(super) service: Option<Arc<SyncService>>,
    pub(super) health: HealthChecker,
}

impl Reactor {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn operation_store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn sync(&self) -> ReactorResult<&Arc<SyncManager>> {
        self.sync.as_ref().ok_or(ReactorError::SyncDisabled)
    }

    /// Responder side of the polling protocol, to be served by a transport
    pub fn sync_service(&self) -> ReactorResult<Arc<SyncService>> {
        self.service.clone().ok_or(ReactorError::SyncDisabled)
    }

    fn check_alive(&self) -> ReactorResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ReactorError::Killed);
        }
        Ok(())
    }

    /// Queue the creation of a document; a fresh id is generated when none is given
    #[instrument(skip(self))]
    pub fn create(&self, document_type: &str, document_id: Option<&str>) -> ReactorResult<JobInfo> {
        self.check_alive()?;
        if !self.models.contains(document_type) {
            return Err(ModelError::UnknownDocumentType(document_type.to_string()).into());
        }

        let document_id = document_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let info = self.client.mutate(
            &document_id,
            DEFAULT_BRANCH,
            vec![create_document_action(document_type)],
            Some(document_type),
        )?;
        Ok(info)
    }

    #[instrument(skip(self, actions), fields(actions = actions.len()))]
    pub fn mutate(&self, document_id: &str, branch: &str, actions: Vec<Action>) -> ReactorResult<JobInfo> {
        self.check_alive()?;
        Ok(self.client.mutate(document_id, branch, actions, None)?)
    }

    /// Queue several mutations that run in the given order
    pub fn mutate_batch(&self, document_id: &str, branch: &str, batches: Vec<Vec<Action>>) -> ReactorResult<Vec<JobInfo>> {
        self.check_alive()?;
        Ok(self.client.mutate_batch(document_id, branch, batches)?)
    }

    /// Queue operations received from elsewhere for merging; one job per scope
    #[instrument(skip(self, operations), fields(operations = operations.len()))]
    pub fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<OperationWithContext>,
        source_remote: Option<&str>,
    ) -> ReactorResult<Vec<JobInfo>> {
        self.check_alive()?;
        Ok(self.client.load(document_id, branch, operations, source_remote)?)
    }

    pub fn delete_document(&self, document_id: &str) -> ReactorResult<JobInfo> {
        self.mutate(document_id, DEFAULT_BRANCH, vec![delete_document_action()])
    }

    pub async fn get(&self, document_id: &str, filter: &ViewFilter) -> ReactorResult<Document> {
        Ok(self.view.get(document_id, filter, None).await?)
    }

    /// Operations per scope
    pub async fn get_operations(
        &self,
        document_id: &str,
        filter: &ViewFilter,
        paging: Option<&PagingOptions>,
    ) -> ReactorResult<BTreeMap<String, PagedResults<Operation>>> {
        Ok(self.view.get_operations(document_id, filter, paging, None).await?)
    }

    pub async fn get_since_ordinal(
        &self,
        ordinal: Ordinal,
        paging: Option<&PagingOptions>,
    ) -> ReactorResult<PagedResults<OperationWithContext>> {
        Ok(self.view.get_since_ordinal(ordinal, paging, None).await?)
    }

    /// Ids of the documents of one type
    pub async fn find(&self, document_type: &str, paging: Option<&PagingOptions>) -> ReactorResult<PagedResults<String>> {
        Ok(self.view.find_by_type(document_type, paging, None).await?)
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobInfo> {
        self.client.get_status(job_id)
    }

    pub async fn wait_for_job(&self, job_id: &str, signal: Option<&AbortSignal>) -> ReactorResult<JobInfo> {
        Ok(self.client.wait(job_id, signal).await?)
    }

    /// Aggregated health of the queue and every remote channel
    pub async fn health(&self) -> HealthCheck {
        let remotes = self.sync.as_ref().map(|sync| sync.health()).unwrap_or_default();

        let stale: Vec<String> = self
            .health
            .check_health()
            .await
            .components
            .into_iter()
            .map(|component| component.name)
            .filter(|name| name.starts_with("remote:") && !remotes.iter().any(|c| &c.name == name))
            .collect();
        for name in stale {
            self.health.remove(&name).await;
        }

        for component in remotes {
            self.health.report(component).await;
        }
        self.health
            .report(checks::check_queue(self.queue.total_size(), self.queue.is_blocked()))
            .await;

        self.health.check_health().await
    }

    /// Stop sync, refuse new jobs and wait for the workers to exit. Jobs
    /// still queued are dropped.
    pub async fn kill(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        if let Some(sync) = &self.sync {
            sync.shutdown().await;
        }
        self.queue.block(None);
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "job worker panicked");
            }
        }
        info!("reactor killed");
    }
}
