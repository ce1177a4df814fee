//! Same-process channel: outbox items are handed straight to the peer's
//! `receive`, and the peer reports its inbox progress back through
//! `update_cursor`.

use async_trait::async_trait;
use metrics::counter;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::registry::ChannelRegistry;
use super::{Channel, ChannelCore};
use crate::core_store::{CursorStore, Ordinal};
use crate::core_sync::envelope::SyncEnvelope;
use crate::core_sync::errors::{ChannelError, SyncResult};
use crate::core_sync::mailbox::{InMemoryMailbox, Mailbox};
use crate::core_sync::sync_operation::SyncOperation;
use crate::core_sync::types::RemoteStatus;
use crate::metrics::ENVELOPES_SENT;

pub struct InternalChannel {
    core: Arc<ChannelCore>,
    peer: String,
    registry: ChannelRegistry,
    weak_self: Weak<InternalChannel>,
}

impl InternalChannel {
    pub fn new(
        id: impl Into<String>,
        remote_name: impl Into<String>,
        peer: impl Into<String>,
        registry: ChannelRegistry,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Arc<Self> {
        let core = ChannelCore::new(id, remote_name, Box::new(InMemoryMailbox::new()), cursor_store);
        let peer = peer.into();

        Arc::new_cyclic(|weak: &Weak<InternalChannel>| {
            let sender = weak.clone();
            core.outbox.on_added(Arc::new(move |items| {
                if let Some(channel) = sender.upgrade() {
                    channel.send(items);
                }
            }));

            let notifier = weak.clone();
            core.inbox.on_removed(Arc::new(move |_| {
                if let Some(channel) = notifier.upgrade() {
                    channel.acknowledge_peer();
                }
            }));

            Self {
                core,
                peer,
                registry,
                weak_self: weak.clone(),
            }
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.core.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer
    }

    /// Deliver every outbox item again, e.g. once the peer (re)appears
    pub fn resend(&self) {
        let items = self.core.outbox.items();
        if !items.is_empty() {
            debug!(remote = %self.core.remote_name, items = items.len(), "resending outbox");
            self.send(&items);
        }
    }

    fn send(&self, items: &[Arc<SyncOperation>]) {
        if self.core.is_shut_down() {
            return;
        }
        let peer = match self.registry.get(&self.peer) {
            Some(peer) => peer,
            None => {
                trace!(remote = %self.core.remote_name, peer = %self.peer, "peer not registered yet");
                return;
            }
        };

        for item in items {
            item.transported();
            let envelope = SyncEnvelope::from_sync_operation(&self.core.id, item);
            match peer.receive(envelope) {
                Ok(()) => {
                    item.started();
                    counter!(ENVELOPES_SENT).increment(1);
                }
                Err(e) => {
                    warn!(remote = %self.core.remote_name, error = %e, "peer refused envelope");
                    break;
                }
            }
        }
    }

    /// Tell the peer how far our inbox has been applied
    fn acknowledge_peer(&self) {
        let ordinal = self.core.inbox.ack_ordinal();
        let peer = match self.registry.get(&self.peer) {
            Some(peer) => peer,
            None => return,
        };
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };

        handle.spawn(async move {
            if let Err(e) = peer.update_cursor(ordinal).await {
                warn!(remote = %peer.core.remote_name, error = %e, "failed to update peer cursor");
            }
        });
    }
}

#[async_trait]
impl Channel for InternalChannel {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn remote_name(&self) -> &str {
        &self.core.remote_name
    }

    fn inbox(&self) -> &dyn Mailbox {
        &self.core.inbox
    }

    fn outbox(&self) -> &dyn Mailbox {
        self.core.outbox.as_ref()
    }

    fn dead_letter(&self) -> &dyn Mailbox {
        &self.core.dead_letter
    }

    async fn init(&self) -> SyncResult<()> {
        self.core.load_cursors().await?;
        if let Some(channel) = self.weak_self.upgrade() {
            self.registry.register(&channel);
        }
        self.core.update_push(|health| health.record_success());
        self.core.update_pull(|health| health.record_success());
        self.resend();
        Ok(())
    }

    fn receive(&self, envelope: SyncEnvelope) -> Result<(), ChannelError> {
        self.core.receive(envelope)
    }

    async fn update_cursor(&self, ordinal: Ordinal) -> SyncResult<()> {
        let trimmed = self.core.trim_outbox(ordinal).await?;
        trace!(remote = %self.core.remote_name, ordinal, trimmed, "outbox trimmed");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.core.shut_down() {
            self.registry.unregister(self);
            debug!(remote = %self.core.remote_name, "internal channel shut down");
        }
    }

    fn health(&self) -> RemoteStatus {
        self.core.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::{CursorType, Database, SqlCursorStore};
    use crate::core_sync::mailbox::tests::sync_op;
    use crate::core_sync::SyncOperationStatus;
    use crate::test_utils::{wait_until, DEFAULT_TEST_TIMEOUT};

    fn cursor_store() -> Arc<dyn CursorStore> {
        Arc::new(SqlCursorStore::new(Database::memory().unwrap()))
    }

    fn pair(registry: &ChannelRegistry) -> (Arc<InternalChannel>, Arc<InternalChannel>) {
        let a = InternalChannel::new("chan-a", "to-b", "chan-b", registry.clone(), cursor_store());
        let b = InternalChannel::new("chan-b", "to-a", "chan-a", registry.clone(), cursor_store());
        (a, b)
    }

    #[tokio::test]
    async fn test_outbox_items_reach_peer_inbox() {
        let registry = ChannelRegistry::new();
        let (a, b) = pair(&registry);
        a.init().await.unwrap();
        b.init().await.unwrap();

        let op = sync_op(3);
        a.outbox().add(vec![op.clone()]);

        assert_eq!(op.status(), SyncOperationStatus::ExecutionPending);
        let received = b.inbox().items();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].remote_name, "to-a");
        assert_eq!(received[0].ordinal(), 3);
    }

    #[tokio::test]
    async fn test_items_wait_for_late_peer() {
        let registry = ChannelRegistry::new();
        let (a, b) = pair(&registry);
        a.init().await.unwrap();

        a.outbox().add(vec![sync_op(1)]);
        assert!(b.inbox().is_empty());

        b.init().await.unwrap();
        assert_eq!(b.inbox().len(), 1);
    }

    #[tokio::test]
    async fn test_applying_inbox_trims_sender_outbox() {
        let registry = ChannelRegistry::new();
        let (a, b) = pair(&registry);
        a.init().await.unwrap();
        b.init().await.unwrap();

        let op = sync_op(5);
        a.outbox().add(vec![op.clone()]);
        let received = b.inbox().items();
        b.inbox().remove(&received);

        let trimmed = wait_until(DEFAULT_TEST_TIMEOUT, || {
            let a = a.clone();
            async move { a.outbox().is_empty() }
        })
        .await;
        assert!(trimmed);
        assert_eq!(op.status(), SyncOperationStatus::Applied);
        assert_eq!(a.outbox().ack_ordinal(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_keeps_outbox() {
        let registry = ChannelRegistry::new();
        let (a, b) = pair(&registry);
        a.init().await.unwrap();
        a.outbox().add(vec![sync_op(1)]);

        a.shutdown().await;
        a.shutdown().await;
        assert_eq!(a.outbox().len(), 1);
        assert!(registry.get("chan-a").is_none());
        assert!(a.receive(SyncEnvelope::operations("x", vec![])).is_err());

        b.init().await.unwrap();
        assert!(b.inbox().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_survives_restart() {
        let registry = ChannelRegistry::new();
        let store = cursor_store();
        let a = InternalChannel::new("chan-a", "to-b", "chan-b", registry.clone(), store.clone());
        a.init().await.unwrap();
        a.update_cursor(12).await.unwrap();
        a.shutdown().await;

        let restarted = InternalChannel::new("chan-a", "to-b", "chan-b", registry, store.clone());
        restarted.init().await.unwrap();
        assert_eq!(restarted.outbox().ack_ordinal(), 12);
        assert_eq!(
            store.get("to-b", CursorType::Outbox, None).await.unwrap().cursor_ordinal,
            12
        );
    }
}
