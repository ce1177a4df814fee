//! Channels move sync operations between this reactor and one remote
//!
//! Every channel owns an inbox, an outbox and a dead-letter mailbox, and
//! persists the ack ordinal of the inbox and outbox as cursors. Removing
//! items from either mailbox persists its cursor in the background;
//! [`Channel::update_cursor`] trims the outbox and persists synchronously.

mod factory;
mod internal;
mod registry;
mod request;
mod response;

pub use factory::ChannelFactory;
pub use internal::InternalChannel;
pub use registry::ChannelRegistry;
pub use request::{PollTiming, RequestChannel};
pub use response::ResponseChannel;

use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::envelope::SyncEnvelope;
use super::errors::{ChannelError, ChannelErrorCause, ChannelErrorSource, SyncResult};
use super::mailbox::{InMemoryMailbox, Mailbox};
use super::sync_operation::SyncOperation;
use super::types::{ChannelHealth, RemoteStatus};
use crate::core_store::{CursorStore, CursorType, Ordinal, StoreResult, SyncCursor};
use crate::lock;
use crate::metrics::ENVELOPES_RECEIVED;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Id shared with the counterpart channel
    fn id(&self) -> &str;

    fn remote_name(&self) -> &str;

    fn inbox(&self) -> &dyn Mailbox;

    fn outbox(&self) -> &dyn Mailbox;

    fn dead_letter(&self) -> &dyn Mailbox;

    /// Load cursors and start whatever drives the channel
    async fn init(&self) -> SyncResult<()>;

    /// Accept an envelope from the counterpart into the inbox
    fn receive(&self, envelope: SyncEnvelope) -> Result<(), ChannelError>;

    /// The counterpart applied everything up to `ordinal`: mark those outbox
    /// items applied, drop them and persist the outbox cursor
    async fn update_cursor(&self, ordinal: Ordinal) -> SyncResult<()>;

    /// Stop timers. Idempotent; the outbox is left as is.
    async fn shutdown(&self);

    fn health(&self) -> RemoteStatus;

    /// Clear failure counters and resume a stopped channel
    fn retry(&self) {}

    /// Outbox items above `latest` as envelopes, marked as handed over
    fn envelopes_after(&self, latest: Ordinal) -> Vec<SyncEnvelope> {
        self.outbox()
            .items()
            .into_iter()
            .filter(|item| item.ordinal() > latest)
            .map(|item| {
                item.transported();
                item.started();
                SyncEnvelope::from_sync_operation(self.id(), &item)
            })
            .collect()
    }
}

/// State and behaviour shared by every channel kind
pub(crate) struct ChannelCore {
    pub(crate) id: String,
    pub(crate) remote_name: String,
    pub(crate) inbox: InMemoryMailbox,
    pub(crate) outbox: Box<dyn Mailbox>,
    pub(crate) dead_letter: InMemoryMailbox,
    cursor_store: Arc<dyn CursorStore>,
    persisted: Mutex<HashMap<CursorType, Ordinal>>,
    status: Mutex<RemoteStatus>,
    shutdown: CancellationToken,
}

impl ChannelCore {
    pub(crate) fn new(
        id: impl Into<String>,
        remote_name: impl Into<String>,
        outbox: Box<dyn Mailbox>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id: id.into(),
            remote_name: remote_name.into(),
            inbox: InMemoryMailbox::new(),
            outbox,
            dead_letter: InMemoryMailbox::new(),
            cursor_store,
            persisted: Mutex::new(HashMap::new()),
            status: Mutex::new(RemoteStatus::default()),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&core);
        core.inbox.on_removed(Arc::new(move |_| {
            if let Some(core) = weak.upgrade() {
                core.schedule_persist(CursorType::Inbox);
            }
        }));
        let weak = Arc::downgrade(&core);
        core.outbox.on_removed(Arc::new(move |_| {
            if let Some(core) = weak.upgrade() {
                core.schedule_persist(CursorType::Outbox);
            }
        }));

        core
    }

    fn mailbox(&self, cursor_type: CursorType) -> &dyn Mailbox {
        match cursor_type {
            CursorType::Inbox => &self.inbox,
            CursorType::Outbox => self.outbox.as_ref(),
        }
    }

    /// Restore both mailboxes to their persisted cursor positions
    pub(crate) async fn load_cursors(&self) -> StoreResult<()> {
        for cursor_type in [CursorType::Inbox, CursorType::Outbox] {
            let cursor = self.cursor_store.get(&self.remote_name, cursor_type, None).await?;
            self.mailbox(cursor_type).init(cursor.cursor_ordinal);
            lock(&self.persisted).insert(cursor_type, cursor.cursor_ordinal);
        }

        debug!(
            remote = %self.remote_name,
            inbox = self.inbox.ack_ordinal(),
            outbox = self.outbox.ack_ordinal(),
            "cursors loaded"
        );
        Ok(())
    }

    /// Write the mailbox's ack ordinal if it moved past the persisted one
    pub(crate) async fn persist(&self, cursor_type: CursorType) -> StoreResult<()> {
        let ordinal = self.mailbox(cursor_type).ack_ordinal();
        if !self.needs_persist(cursor_type, ordinal) {
            return Ok(());
        }

        let cursor = SyncCursor::new(&self.remote_name, cursor_type, ordinal);
        self.cursor_store.upsert(&cursor, None).await?;

        let mut persisted = lock(&self.persisted);
        let entry = persisted.entry(cursor_type).or_insert(0);
        *entry = (*entry).max(ordinal);
        Ok(())
    }

    fn needs_persist(&self, cursor_type: CursorType, ordinal: Ordinal) -> bool {
        ordinal > lock(&self.persisted).get(&cursor_type).copied().unwrap_or(0)
    }

    fn schedule_persist(self: &Arc<Self>, cursor_type: CursorType) {
        if !self.needs_persist(cursor_type, self.mailbox(cursor_type).ack_ordinal()) {
            return;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(remote = %self.remote_name, %cursor_type, "no runtime, cursor not persisted");
                return;
            }
        };

        let core = self.clone();
        handle.spawn(async move {
            if let Err(e) = core.persist(cursor_type).await {
                warn!(remote = %core.remote_name, %cursor_type, error = %e, "failed to persist cursor");
            }
        });
    }

    /// Split an envelope into pending sync operations and add them to the inbox
    pub(crate) fn receive(&self, envelope: SyncEnvelope) -> Result<(), ChannelError> {
        if self.is_shut_down() {
            return Err(ChannelError::new(ChannelErrorSource::Inbox, ChannelErrorCause::ShutDown));
        }

        let sync_ops: Vec<Arc<SyncOperation>> = SyncOperation::from_envelope(envelope, &self.remote_name)
            .into_iter()
            .map(Arc::new)
            .collect();
        for sync_op in &sync_ops {
            sync_op.started();
        }

        counter!(ENVELOPES_RECEIVED).increment(1);
        self.inbox.add(sync_ops);
        Ok(())
    }

    /// Settle outbox items at or below `ordinal` and persist the outbox cursor
    pub(crate) async fn trim_outbox(&self, ordinal: Ordinal) -> StoreResult<usize> {
        let acknowledged: Vec<Arc<SyncOperation>> = self
            .outbox
            .items()
            .into_iter()
            .filter(|item| item.ordinal() <= ordinal)
            .collect();

        for item in &acknowledged {
            item.executed();
        }
        if !acknowledged.is_empty() {
            self.outbox.remove(&acknowledged);
        }
        self.outbox.acknowledge(ordinal);
        self.persist(CursorType::Outbox).await?;
        Ok(acknowledged.len())
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Returns false if the channel was already shut down
    pub(crate) fn shut_down(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    pub(crate) fn status(&self) -> RemoteStatus {
        lock(&self.status).clone()
    }

    pub(crate) fn update_push<F: FnOnce(&mut ChannelHealth)>(&self, f: F) {
        f(&mut lock(&self.status).push);
    }

    pub(crate) fn update_pull<F: FnOnce(&mut ChannelHealth)>(&self, f: F) {
        f(&mut lock(&self.status).pull);
    }
}
