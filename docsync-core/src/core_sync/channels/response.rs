//! Polled side of a remote: no timers, the counterpart drives everything
//! through the sync service

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Channel, ChannelCore};
use crate::core_store::{CursorStore, Ordinal};
use crate::core_sync::envelope::SyncEnvelope;
use crate::core_sync::errors::{ChannelError, SyncResult};
use crate::core_sync::mailbox::{InMemoryMailbox, Mailbox};
use crate::core_sync::types::RemoteStatus;

pub struct ResponseChannel {
    core: Arc<ChannelCore>,
}

impl ResponseChannel {
    pub fn new(id: impl Into<String>, remote_name: impl Into<String>, cursor_store: Arc<dyn CursorStore>) -> Arc<Self> {
        Arc::new(Self {
            core: ChannelCore::new(id, remote_name, Box::new(InMemoryMailbox::new()), cursor_store),
        })
    }
}

#[async_trait]
impl Channel for ResponseChannel {
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
        Ok(())
    }

    fn receive(&self, envelope: SyncEnvelope) -> Result<(), ChannelError> {
        self.core.update_pull(|health| health.record_success());
        self.core.receive(envelope)
    }

    async fn update_cursor(&self, ordinal: Ordinal) -> SyncResult<()> {
        if ordinal > self.core.outbox.ack_ordinal() {
            let trimmed = self.core.trim_outbox(ordinal).await?;
            debug!(remote = %self.core.remote_name, ordinal, trimmed, "counterpart acknowledged");
        }
        self.core.update_push(|health| health.record_success());
        Ok(())
    }

    async fn shutdown(&self) {
        if self.core.shut_down() {
            debug!(remote = %self.core.remote_name, "response channel shut down");
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

    fn cursor_store() -> Arc<dyn CursorStore> {
        Arc::new(SqlCursorStore::new(Database::memory().unwrap()))
    }

    #[tokio::test]
    async fn test_envelopes_after_latest() {
        let channel = ResponseChannel::new("chan", "caller", cursor_store());
        let (two, six) = (sync_op(2), sync_op(6));
        channel.outbox().add(vec![two.clone(), six.clone()]);

        let envelopes = channel.envelopes_after(2);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].operations[0].context.ordinal, 6);
        assert_eq!(six.status(), SyncOperationStatus::ExecutionPending);
        assert_eq!(two.status(), SyncOperationStatus::Unknown);
    }

    #[tokio::test]
    async fn test_update_cursor_round_trips_through_restart() {
        let store = cursor_store();
        let channel = ResponseChannel::new("chan", "caller", store.clone());
        channel.init().await.unwrap();
        channel.outbox().add(vec![sync_op(3), sync_op(8)]);

        channel.update_cursor(3).await.unwrap();
        assert_eq!(channel.outbox().len(), 1);
        channel.shutdown().await;

        let restarted = ResponseChannel::new("chan", "caller", store.clone());
        restarted.init().await.unwrap();
        assert_eq!(restarted.outbox().ack_ordinal(), 3);
        assert_eq!(store.get("caller", CursorType::Outbox, None).await.unwrap().cursor_ordinal, 3);
    }
}
