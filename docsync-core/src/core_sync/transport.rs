//! Transport seam between a polling channel and the remote's sync service
//!
//! [`SyncTransport`] is the three-call sync RPC surface. [`LocalTransport`]
//! serves it from an in-process [`SyncService`], passing every request and
//! response through JSON so the wire types are exercised, and can be taken
//! offline to simulate outages.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

use super::envelope::SyncEnvelope;
use super::errors::{SyncError, TransportError};
use super::service::SyncService;
use super::types::RemoteFilter;
use crate::core_store::Ordinal;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchChannelInput {
    pub id: String,
    pub name: String,
    pub collection_id: String,
    pub filter: RemoteFilter,
    pub since_timestamp_utc_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub envelopes: Vec<SyncEnvelope>,
    /// Highest ordinal the responder has applied from the caller
    pub ack_ordinal: Ordinal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRejection {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub rejected: Vec<PushRejection>,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Register the caller with the responder, creating its channel if needed
    async fn touch_channel(&self, input: TouchChannelInput) -> Result<(), TransportError>;

    /// Acknowledge `outbox_ack` and fetch envelopes above `outbox_latest`
    async fn poll_sync_envelopes(
        &self,
        channel_id: &str,
        outbox_ack: Ordinal,
        outbox_latest: Ordinal,
    ) -> Result<PollResponse, TransportError>;

    async fn push_sync_envelopes(&self, envelopes: Vec<SyncEnvelope>) -> Result<PushResponse, TransportError>;
}

/// Transports by url, shared by every channel factory of a process
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: Arc<RwLock<HashMap<String, Arc<dyn SyncTransport>>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: impl Into<String>, transport: Arc<dyn SyncTransport>) {
        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        transports.insert(url.into(), transport);
    }

    pub fn get(&self, url: &str) -> Option<Arc<dyn SyncTransport>> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports.get(url).cloned()
    }
}

pub struct LocalTransport {
    service: Arc<SyncService>,
    online: AtomicBool,
}

impl LocalTransport {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unavailable("local transport is offline".into()))
        }
    }
}

/// Serialize and parse back, as a network hop would
fn over_wire<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, TransportError> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::Protocol(e.to_string()))?;
    trace!(bytes = bytes.len(), "local transport message");
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Protocol(e.to_string()))
}

fn remote_error(error: SyncError) -> TransportError {
    match error {
        SyncError::ChannelNotFound(id) => TransportError::ChannelNotFound(id),
        SyncError::ShutDown => TransportError::Unavailable(error.to_string()),
        other => TransportError::Remote(other.to_string()),
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn touch_channel(&self, input: TouchChannelInput) -> Result<(), TransportError> {
        self.check_online()?;
        let input = over_wire(&input)?;
        self.service.touch_channel(input).await.map_err(remote_error)
    }

    async fn poll_sync_envelopes(
        &self,
        channel_id: &str,
        outbox_ack: Ordinal,
        outbox_latest: Ordinal,
    ) -> Result<PollResponse, TransportError> {
        self.check_online()?;
        let response = self
            .service
            .poll_sync_envelopes(channel_id, outbox_ack, outbox_latest)
            .await
            .map_err(remote_error)?;
        over_wire(&response)
    }

    async fn push_sync_envelopes(&self, envelopes: Vec<SyncEnvelope>) -> Result<PushResponse, TransportError> {
        self.check_online()?;
        let envelopes = over_wire(&envelopes)?;
        let response = self
            .service
            .push_sync_envelopes(envelopes)
            .await
            .map_err(remote_error)?;
        over_wire(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl SyncTransport for Unreachable {
        async fn touch_channel(&self, _input: TouchChannelInput) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("down".into()))
        }

        async fn poll_sync_envelopes(&self, _: &str, _: Ordinal, _: Ordinal) -> Result<PollResponse, TransportError> {
            Err(TransportError::Unavailable("down".into()))
        }

        async fn push_sync_envelopes(&self, _: Vec<SyncEnvelope>) -> Result<PushResponse, TransportError> {
            Err(TransportError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = TransportRegistry::new();
        assert!(registry.get("local://a").is_none());

        registry.register("local://a", Arc::new(Unreachable));
        let transport = registry.get("local://a").unwrap();
        assert!(matches!(
            transport.poll_sync_envelopes("c", 0, 0).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn test_poll_response_wire_format() {
        let response = PollResponse {
            envelopes: vec![SyncEnvelope::operations("c", vec![])],
            ack_ordinal: 7,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["ackOrdinal"], 7);
        assert_eq!(over_wire(&response).unwrap(), response);
    }

    #[test]
    fn test_remote_errors_keep_channel_not_found() {
        assert!(matches!(
            remote_error(SyncError::ChannelNotFound("x".into())),
            TransportError::ChannelNotFound(_)
        ));
        assert!(matches!(
            remote_error(SyncError::RemoteExists("x".into())),
            TransportError::Remote(_)
        ));
    }
}
