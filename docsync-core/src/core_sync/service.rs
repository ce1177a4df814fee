//! Responder side of the polling protocol
//!
//! A caller touches its channel once, then pushes envelopes and polls for
//! envelopes addressed to it. Each call resolves the caller's channel by id
//! on the local [`SyncManager`].

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::errors::{SyncError, SyncResult};
use super::envelope::SyncEnvelope;
use super::manager::{Remote, SyncManager};
use super::transport::{PollResponse, PushRejection, PushResponse, TouchChannelInput};
use super::types::{ChannelConfig, RemoteOptions};
use crate::core_model::ModelRegistry;
use crate::core_store::Ordinal;

pub struct SyncService {
    manager: Arc<SyncManager>,
    models: ModelRegistry,
}

impl SyncService {
    pub fn new(manager: Arc<SyncManager>, models: ModelRegistry) -> Self {
        Self { manager, models }
    }

    fn channel(&self, channel_id: &str) -> SyncResult<Arc<Remote>> {
        self.manager
            .get_by_id(channel_id)
            .ok_or_else(|| SyncError::ChannelNotFound(channel_id.to_string()))
    }

    /// Create a polled remote for the caller unless one already exists
    #[instrument(skip(self, input), fields(channel_id = %input.id, name = %input.name))]
    pub async fn touch_channel(&self, input: TouchChannelInput) -> SyncResult<()> {
        if self.manager.get_by_id(&input.id).is_some() {
            return Ok(());
        }

        self.manager
            .add_with_id(
                &input.id,
                &input.name,
                &input.collection_id,
                ChannelConfig::Polled,
                input.filter,
                RemoteOptions {
                    since_timestamp_utc_ms: input.since_timestamp_utc_ms,
                },
            )
            .await?;
        info!("channel touched");
        Ok(())
    }

    /// Acknowledge what the caller applied and hand out what it has not seen
    pub async fn poll_sync_envelopes(
        &self,
        channel_id: &str,
        outbox_ack: Ordinal,
        outbox_latest: Ordinal,
    ) -> SyncResult<PollResponse> {
        if self.manager.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        let remote = self.channel(channel_id)?;
        let channel = remote.channel();

        if outbox_ack > 0 {
            channel.update_cursor(outbox_ack).await?;
        }

        let envelopes = channel.envelopes_after(outbox_latest);
        debug!(channel_id, outbox_ack, outbox_latest, envelopes = envelopes.len(), "poll");
        Ok(PollResponse {
            envelopes,
            ack_ordinal: channel.inbox().ack_ordinal(),
        })
    }

    /// Validate pushed envelopes and queue the valid ones for apply.
    /// Envelopes with an invalid action are rejected as a whole.
    pub async fn push_sync_envelopes(&self, envelopes: Vec<SyncEnvelope>) -> SyncResult<PushResponse> {
        if self.manager.is_shut_down() {
            return Err(SyncError::ShutDown);
        }

        let mut response = PushResponse::default();
        for envelope in envelopes {
            let remote = self.channel(&envelope.channel_meta.id)?;
            let key = envelope.key.clone().unwrap_or_default();

            if let Err(error) = self.validate(&envelope) {
                warn!(remote = %remote.name(), %key, %error, "rejected pushed envelope");
                response.rejected.push(PushRejection { key, error });
                continue;
            }

            remote.channel().receive(envelope)?;
        }
        Ok(response)
    }

    fn validate(&self, envelope: &SyncEnvelope) -> Result<(), String> {
        envelope.operations.iter().try_for_each(|item| {
            self.models
                .validate(&item.context.document_type, &item.operation.action)
                .map_err(|e| e.to_string())
        })
    }
}
