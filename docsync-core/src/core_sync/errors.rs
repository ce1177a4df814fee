/*
    errors.rs - Error types for sync channels and the sync manager
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core_queue::JobError;
use crate::core_store::StoreError;

/// Mailbox side a channel error was raised on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelErrorSource {
    Inbox,
    Outbox,
}

impl fmt::Display for ChannelErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelErrorSource::Inbox => f.write_str("inbox"),
            ChannelErrorSource::Outbox => f.write_str("outbox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelErrorCause {
    /// Network or peer unavailable; retried with backoff
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote refused the operations; never retried
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Received operations could not be applied locally
    #[error("failed to apply: {0}")]
    Apply(String),

    #[error("channel is shut down")]
    ShutDown,
}

/// Failure attached to a sync operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    pub source: ChannelErrorSource,
    pub cause: ChannelErrorCause,
}

impl ChannelError {
    pub fn new(source: ChannelErrorSource, cause: ChannelErrorCause) -> Self {
        Self { source, cause }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self.cause, ChannelErrorCause::Transport(_))
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source, self.cause)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Failure reported by a [`SyncTransport`](super::transport::SyncTransport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The responder has no channel with this id; touch it again
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed message: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote with name '{0}' does not exist")]
    RemoteNotFound(String),

    #[error("Remote with name '{0}' already exists")]
    RemoteExists(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Sync manager is shut down")]
    ShutDown,

    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),
}

pub type SyncResult<T> = Result<T, SyncError>;
