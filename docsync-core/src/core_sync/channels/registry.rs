//! In-process channel directory used to pair internal channels

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use super::internal::InternalChannel;
use crate::lock;

/// Channel id → internal channel, resolved at send time. Holds weak
/// references only, so two channels can point at each other.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, Weak<InternalChannel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel`; channels waiting on it resend their outboxes
    pub fn register(&self, channel: &Arc<InternalChannel>) {
        let waiting: Vec<Arc<InternalChannel>> = {
            let mut channels = lock(&self.channels);
            channels.retain(|_, weak| weak.strong_count() > 0);
            channels.insert(channel.channel_id().to_string(), Arc::downgrade(channel));
            channels
                .values()
                .filter_map(Weak::upgrade)
                .filter(|other| other.peer_id() == channel.channel_id())
                .collect()
        };

        debug!(channel = channel.channel_id(), waiting = waiting.len(), "internal channel registered");
        for other in waiting {
            other.resend();
        }
    }

    /// Drop `id` unless it was already replaced by a newer channel
    pub fn unregister(&self, channel: &InternalChannel) {
        let mut channels = lock(&self.channels);
        let current = channels
            .get(channel.channel_id())
            .map(|weak| std::ptr::eq(weak.as_ptr(), channel))
            .unwrap_or(false);
        if current {
            channels.remove(channel.channel_id());
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<InternalChannel>> {
        lock(&self.channels).get(id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).values().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
