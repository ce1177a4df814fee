//! Replication of the operation log between reactors
//!
//! A remote pairs a persisted [`RemoteRecord`] with a [`Channel`]. The
//! [`SyncManager`] fans written operations out to remote outboxes and applies
//! what arrives in their inboxes. Internal channels connect reactors of one
//! process; request and response channels speak the polling protocol of
//! [`SyncService`] through a [`SyncTransport`].

pub mod buffered_mailbox;
pub mod channels;
pub mod envelope;
pub mod errors;
pub mod mailbox;
pub mod manager;
pub mod service;
pub mod sync_operation;
pub mod transport;
pub mod types;

pub use buffered_mailbox::BufferedMailbox;
pub use channels::{
    Channel, ChannelFactory, ChannelRegistry, InternalChannel, PollTiming, RequestChannel, ResponseChannel,
};
pub use envelope::{sort_envelopes, ChannelMeta, EnvelopeType, SyncEnvelope};
pub use errors::{ChannelError, ChannelErrorCause, ChannelErrorSource, SyncError, SyncResult, TransportError};
pub use mailbox::{InMemoryMailbox, Mailbox, MailboxCallback};
pub use manager::{Remote, SyncManager};
pub use service::SyncService;
pub use sync_operation::{StatusListener, SyncOperation, SyncOperationStatus};
pub use transport::{
    LocalTransport, PollResponse, PushRejection, PushResponse, SyncTransport, TouchChannelInput,
    TransportRegistry,
};
pub use types::{
    ChannelConfig, ChannelHealth, ChannelHealthState, RemoteFilter, RemoteOptions, RemoteRecord, RemoteStatus,
};
