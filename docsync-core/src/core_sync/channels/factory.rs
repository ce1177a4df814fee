//! Channel construction from persisted remote records

use std::sync::Arc;

use super::internal::InternalChannel;
use super::registry::ChannelRegistry;
use super::request::{PollTiming, RequestChannel};
use super::response::ResponseChannel;
use super::Channel;
use crate::config::SyncConfig;
use crate::core_store::CursorStore;
use crate::core_sync::errors::{SyncError, SyncResult};
use crate::core_sync::transport::{TouchChannelInput, TransportRegistry};
use crate::core_sync::types::{ChannelConfig, RemoteRecord};

#[derive(Clone)]
pub struct ChannelFactory {
    registry: ChannelRegistry,
    transports: TransportRegistry,
    cursor_store: Arc<dyn CursorStore>,
    config: SyncConfig,
}

impl ChannelFactory {
    pub fn new(
        registry: ChannelRegistry,
        transports: TransportRegistry,
        cursor_store: Arc<dyn CursorStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            transports,
            cursor_store,
            config,
        }
    }

    pub fn create(&self, record: &RemoteRecord) -> SyncResult<Arc<dyn Channel>> {
        let channel: Arc<dyn Channel> = match &record.channel_config {
            ChannelConfig::Internal { peer } => InternalChannel::new(
                &record.id,
                &record.name,
                peer,
                self.registry.clone(),
                self.cursor_store.clone(),
            ),
            ChannelConfig::Polling {
                url,
                poll_interval,
                retry_base_delay,
                retry_max_delay,
                max_failures,
            } => {
                let transport = self
                    .transports
                    .get(url)
                    .ok_or_else(|| SyncError::InvalidConfig(format!("no transport registered for {}", url)))?;
                let touch = TouchChannelInput {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    collection_id: record.collection_id.clone(),
                    filter: record.filter.clone(),
                    since_timestamp_utc_ms: record.options.since_timestamp_utc_ms,
                };
                let timing = PollTiming {
                    poll_interval: *poll_interval,
                    retry_base_delay: *retry_base_delay,
                    retry_max_delay: *retry_max_delay,
                    max_failures: *max_failures,
                };
                RequestChannel::new(touch, transport, timing, &self.config, self.cursor_store.clone())
            }
            ChannelConfig::Polled => ResponseChannel::new(&record.id, &record.name, self.cursor_store.clone()),
        };
        Ok(channel)
    }
}
