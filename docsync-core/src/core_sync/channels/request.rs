//! Polling side of a remote
//!
//! Two background loops drive the channel. The poll loop fetches envelopes
//! from the responder and learns how far it applied our pushes. The push loop
//! sends outbox items as the (buffered) outbox reports them. Transport
//! failures back off exponentially; after `max_failures` consecutive failures
//! a loop stops until [`Channel::retry`].

use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{Channel, ChannelCore};
use crate::config::SyncConfig;
use crate::core_store::{CursorStore, Ordinal};
use crate::core_sync::buffered_mailbox::BufferedMailbox;
use crate::core_sync::envelope::{sort_envelopes, SyncEnvelope};
use crate::core_sync::errors::{ChannelError, ChannelErrorCause, ChannelErrorSource, SyncResult, TransportError};
use crate::core_sync::mailbox::Mailbox;
use crate::core_sync::sync_operation::SyncOperation;
use crate::core_sync::transport::{PollResponse, PushResponse, SyncTransport, TouchChannelInput};
use crate::core_sync::types::RemoteStatus;
use crate::lock;
use crate::metrics::{ENVELOPES_SENT, POLL_FAILURES, PUSH_FAILURES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub poll_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_failures: u32,
}

impl PollTiming {
    /// `base * 2^(failures - 1)`, capped at the max delay
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

pub struct RequestChannel {
    core: Arc<ChannelCore>,
    transport: Arc<dyn SyncTransport>,
    touch: TouchChannelInput,
    timing: PollTiming,
    /// Outbox items not yet accepted by the responder, in outbox order
    needs_push: Mutex<Vec<Arc<SyncOperation>>>,
    push_wake: Notify,
    push_retry: Notify,
    poll_wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<RequestChannel>,
}

impl RequestChannel {
    pub fn new(
        touch: TouchChannelInput,
        transport: Arc<dyn SyncTransport>,
        timing: PollTiming,
        config: &SyncConfig,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Arc<Self> {
        let outbox = BufferedMailbox::from_config(config);
        let core = ChannelCore::new(touch.id.clone(), touch.name.clone(), Box::new(outbox), cursor_store);

        Arc::new_cyclic(|weak: &Weak<RequestChannel>| {
            let added = weak.clone();
            core.outbox.on_added(Arc::new(move |items| {
                if let Some(channel) = added.upgrade() {
                    channel.queue_push(items);
                }
            }));

            let removed = weak.clone();
            core.outbox.on_removed(Arc::new(move |items| {
                if let Some(channel) = removed.upgrade() {
                    let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
                    lock(&channel.needs_push).retain(|pending| !ids.contains(&pending.id.as_str()));
                }
            }));

            Self {
                core,
                transport,
                touch,
                timing,
                needs_push: Mutex::new(Vec::new()),
                push_wake: Notify::new(),
                push_retry: Notify::new(),
                poll_wake: Notify::new(),
                tasks: Mutex::new(Vec::new()),
                weak_self: weak.clone(),
            }
        })
    }

    fn queue_push(&self, items: &[Arc<SyncOperation>]) {
        {
            let mut pending = lock(&self.needs_push);
            for item in items {
                match pending.iter().position(|existing| existing.id == item.id) {
                    Some(position) => pending[position] = item.clone(),
                    None => pending.push(item.clone()),
                }
            }
        }
        self.push_wake.notify_one();
    }

    /// Number of outbox items still to be pushed
    pub fn pending_push(&self) -> usize {
        lock(&self.needs_push).len()
    }

    async fn touch(&self) -> Result<(), TransportError> {
        self.transport.touch_channel(self.touch.clone()).await?;
        debug!(remote = %self.core.remote_name, channel = %self.core.id, "channel touched");
        Ok(())
    }

    /// One poll cycle; returns the number of envelopes received
    #[instrument(skip(self), fields(remote = %self.core.remote_name))]
    pub async fn poll(&self) -> SyncResult<usize> {
        let response = match self.request_poll().await {
            Err(TransportError::ChannelNotFound(_)) => {
                self.touch().await?;
                self.request_poll().await?
            }
            other => other?,
        };

        self.core.trim_outbox(response.ack_ordinal).await?;

        let mut envelopes = response.envelopes;
        sort_envelopes(&mut envelopes);
        let received = envelopes.len();
        for envelope in envelopes {
            self.core.receive(envelope)?;
        }

        if received > 0 {
            debug!(received, "envelopes polled");
        }
        Ok(received)
    }

    async fn request_poll(&self) -> Result<PollResponse, TransportError> {
        self.transport
            .poll_sync_envelopes(
                &self.core.id,
                self.core.inbox.ack_ordinal(),
                self.core.inbox.latest_ordinal(),
            )
            .await
    }

    /// Push every pending outbox item in order; returns how many were sent
    pub async fn push_pending(&self) -> SyncResult<usize> {
        let batch: Vec<Arc<SyncOperation>> = lock(&self.needs_push).clone();
        if batch.is_empty() {
            return Ok(0);
        }

        for item in &batch {
            item.transported();
        }
        let envelopes: Vec<SyncEnvelope> = batch
            .iter()
            .map(|item| SyncEnvelope::from_sync_operation(&self.core.id, item))
            .collect();

        let response = match self.request_push(envelopes.clone()).await {
            Err(TransportError::ChannelNotFound(_)) => match self.touch().await {
                Ok(()) => self.request_push(envelopes.clone()).await,
                Err(e) => Err(e),
            },
            other => other,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                for item in &batch {
                    item.started();
                }
                return Err(e.into());
            }
        };

        {
            let sent: Vec<&str> = batch.iter().map(|item| item.id.as_str()).collect();
            lock(&self.needs_push).retain(|pending| !sent.contains(&pending.id.as_str()));
        }
        counter!(ENVELOPES_SENT).increment(envelopes.len() as u64);

        let rejected: HashMap<String, String> = response
            .rejected
            .into_iter()
            .map(|rejection| (rejection.key, rejection.error))
            .collect();

        let mut dead = Vec::new();
        for (item, envelope) in batch.iter().zip(&envelopes) {
            match envelope.key.as_ref().and_then(|key| rejected.get(key)) {
                Some(error) => {
                    warn!(remote = %self.core.remote_name, sync_operation = %item.id, %error, "push rejected");
                    item.failed(ChannelError::new(
                        ChannelErrorSource::Outbox,
                        ChannelErrorCause::Rejected(error.clone()),
                    ));
                    dead.push(item.clone());
                }
                None => {
                    item.started();
                }
            }
        }

        if !dead.is_empty() {
            self.core.dead_letter.add(dead.clone());
            self.core.outbox.remove(&dead);
        }
        Ok(batch.len())
    }

    async fn request_push(&self, envelopes: Vec<SyncEnvelope>) -> Result<PushResponse, TransportError> {
        self.transport.push_sync_envelopes(envelopes).await
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let token = self.core.token();
        loop {
            let failures = self.core.status().pull.failure_count;
            if failures >= self.timing.max_failures {
                warn!(remote = %self.core.remote_name, failures, "polling stopped");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.poll_wake.notified() => continue,
                }
            }

            match self.poll().await {
                Ok(_) => self.core.update_pull(|health| health.record_success()),
                Err(e) => {
                    counter!(POLL_FAILURES).increment(1);
                    warn!(remote = %self.core.remote_name, error = %e, "poll failed");
                    self.core.update_pull(|health| health.record_failure(e.to_string()));
                }
            }
            if token.is_cancelled() {
                break;
            }

            let failures = self.core.status().pull.failure_count;
            let delay = if failures == 0 {
                self.timing.poll_interval
            } else {
                self.timing.backoff(failures)
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.poll_wake.notified() => {}
            }
        }
        debug!(remote = %self.core.remote_name, "poll loop exited");
    }

    async fn run_push_loop(self: Arc<Self>) {
        let token = self.core.token();
        loop {
            let failures = self.core.status().push.failure_count;
            if failures >= self.timing.max_failures {
                warn!(remote = %self.core.remote_name, failures, "pushing stopped");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.push_retry.notified() => continue,
                }
            } else if failures > 0 {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.timing.backoff(failures)) => {}
                    _ = self.push_retry.notified() => {}
                }
            } else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.push_wake.notified() => {}
                }
            }

            match self.push_pending().await {
                Ok(0) if failures == 0 => {}
                Ok(sent) => {
                    debug!(remote = %self.core.remote_name, sent, "outbox pushed");
                    self.core.update_push(|health| health.record_success());
                }
                Err(e) => {
                    counter!(PUSH_FAILURES).increment(1);
                    warn!(remote = %self.core.remote_name, error = %e, "push failed");
                    self.core.update_push(|health| health.record_failure(e.to_string()));
                }
            }
        }
        debug!(remote = %self.core.remote_name, "push loop exited");
    }
}

#[async_trait]
impl Channel for RequestChannel {
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

        if let Err(e) = self.touch().await {
            warn!(remote = %self.core.remote_name, error = %e, "touch failed, polling will retry");
        }

        let channel = match self.weak_self.upgrade() {
            Some(channel) => channel,
            None => return Ok(()),
        };
        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(channel.clone().run_poll_loop()));
        tasks.push(tokio::spawn(channel.run_push_loop()));

        info!(remote = %self.core.remote_name, interval = ?self.timing.poll_interval, "polling started");
        Ok(())
    }

    fn receive(&self, envelope: SyncEnvelope) -> Result<(), ChannelError> {
        self.core.receive(envelope)
    }

    async fn update_cursor(&self, ordinal: Ordinal) -> SyncResult<()> {
        self.core.trim_outbox(ordinal).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.core.shut_down() {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(remote = %self.core.remote_name, error = %e, "channel task panicked");
                }
            }
        }
        debug!(remote = %self.core.remote_name, "request channel shut down");
    }

    fn health(&self) -> RemoteStatus {
        self.core.status()
    }

    fn retry(&self) {
        self.core.update_pull(|health| health.reset());
        self.core.update_push(|health| health.reset());
        self.poll_wake.notify_one();
        self.push_retry.notify_one();
        info!(remote = %self.core.remote_name, "channel retry requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::{Database, SqlCursorStore};
    use crate::core_sync::mailbox::tests::sync_op;
    use crate::core_sync::transport::PushRejection;
    use crate::core_sync::types::{ChannelHealthState, RemoteFilter};
    use crate::core_sync::SyncOperationStatus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted responder
    #[derive(Default)]
    struct FakeTransport {
        offline: AtomicBool,
        polls: AtomicUsize,
        touches: AtomicUsize,
        ack: Mutex<Ordinal>,
        inbound: Mutex<Vec<SyncEnvelope>>,
        pushed: Mutex<Vec<SyncEnvelope>>,
        reject: Mutex<Option<String>>,
    }

    impl FakeTransport {
        fn check(&self) -> Result<(), TransportError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(TransportError::Unavailable("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SyncTransport for FakeTransport {
        async fn touch_channel(&self, _input: TouchChannelInput) -> Result<(), TransportError> {
            self.check()?;
            self.touches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn poll_sync_envelopes(&self, _: &str, _: Ordinal, _: Ordinal) -> Result<PollResponse, TransportError> {
            self.check()?;
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(PollResponse {
                envelopes: std::mem::take(&mut *self.inbound.lock().unwrap()),
                ack_ordinal: *self.ack.lock().unwrap(),
            })
        }

        async fn push_sync_envelopes(&self, envelopes: Vec<SyncEnvelope>) -> Result<PushResponse, TransportError> {
            self.check()?;
            let rejected = match self.reject.lock().unwrap().clone() {
                Some(error) => envelopes
                    .iter()
                    .filter_map(|e| e.key.clone())
                    .map(|key| PushRejection { key, error: error.clone() })
                    .collect(),
                None => Vec::new(),
            };
            self.pushed.lock().unwrap().extend(envelopes);
            Ok(PushResponse { rejected })
        }
    }

    fn timing() -> PollTiming {
        PollTiming {
            poll_interval: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(8),
            max_failures: 3,
        }
    }

    fn channel(transport: Arc<FakeTransport>) -> Arc<RequestChannel> {
        let touch = TouchChannelInput {
            id: "chan".into(),
            name: "peer".into(),
            collection_id: "drive".into(),
            filter: RemoteFilter::default(),
            since_timestamp_utc_ms: None,
        };
        let config = SyncConfig {
            buffer_window: Duration::from_millis(100),
            ..SyncConfig::default()
        };
        let store: Arc<dyn CursorStore> = Arc::new(SqlCursorStore::new(Database::memory().unwrap()));
        RequestChannel::new(touch, transport, timing(), &config, store)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let timing = timing();
        assert_eq!(timing.backoff(1), Duration::from_secs(1));
        assert_eq!(timing.backoff(2), Duration::from_secs(2));
        assert_eq!(timing.backoff(3), Duration::from_secs(4));
        assert_eq!(timing.backoff(9), Duration::from_secs(8));
        assert_eq!(timing.backoff(500), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_poll_trims_outbox_and_fills_inbox() {
        let transport = Arc::new(FakeTransport::default());
        let channel = channel(transport.clone());

        let sent = sync_op(4);
        channel.outbox().add(vec![sent.clone()]);
        *transport.ack.lock().unwrap() = 4;
        transport
            .inbound
            .lock()
            .unwrap()
            .push(SyncEnvelope::from_sync_operation("chan", &sync_op(9)));

        assert_eq!(channel.poll().await.unwrap(), 1);
        assert!(channel.outbox().is_empty());
        assert_eq!(sent.status(), SyncOperationStatus::Applied);
        assert_eq!(channel.inbox().len(), 1);
        assert_eq!(channel.inbox().items()[0].status(), SyncOperationStatus::ExecutionPending);
        assert_eq!(channel.inbox().latest_ordinal(), 9);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_items_pending() {
        let transport = Arc::new(FakeTransport::default());
        let channel = channel(transport.clone());
        let op = sync_op(1);
        channel.outbox().add(vec![op.clone()]);
        channel.outbox().flush();

        transport.offline.store(true, Ordering::SeqCst);
        assert!(channel.push_pending().await.is_err());
        assert_eq!(op.status(), SyncOperationStatus::ExecutionPending);
        assert_eq!(channel.pending_push(), 1);
        assert_eq!(channel.outbox().len(), 1);

        transport.offline.store(false, Ordering::SeqCst);
        assert_eq!(channel.push_pending().await.unwrap(), 1);
        assert_eq!(channel.pending_push(), 0);
        assert_eq!(transport.pushed.lock().unwrap().len(), 1);
        // Still waiting for the responder's ack.
        assert_eq!(channel.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_push_is_dead_lettered() {
        let transport = Arc::new(FakeTransport::default());
        *transport.reject.lock().unwrap() = Some("invalid".into());
        let channel = channel(transport.clone());
        let op = sync_op(1);
        channel.outbox().add(vec![op.clone()]);
        channel.outbox().flush();

        channel.push_pending().await.unwrap();
        assert_eq!(op.status(), SyncOperationStatus::Error);
        assert!(!op.error().unwrap().is_recoverable());
        assert!(channel.outbox().is_empty());
        assert_eq!(channel.dead_letter().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_after_max_failures_until_retry() {
        let transport = Arc::new(FakeTransport::default());
        transport.offline.store(true, Ordering::SeqCst);
        let channel = channel(transport.clone());
        channel.init().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        let health = channel.health();
        assert_eq!(health.pull.state, ChannelHealthState::Error);
        assert_eq!(health.pull.failure_count, 3);

        transport.offline.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.polls.load(Ordering::SeqCst), 0);

        channel.retry();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.polls.load(Ordering::SeqCst) >= 1);
        assert_eq!(channel.health().pull.state, ChannelHealthState::Running);

        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_loop_sends_buffered_outbox() {
        let transport = Arc::new(FakeTransport::default());
        let channel = channel(transport.clone());
        channel.init().await.unwrap();
        assert_eq!(transport.touches.load(Ordering::SeqCst), 1);

        channel.outbox().add(vec![sync_op(1)]);
        channel.outbox().add(vec![sync_op(2)]);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(transport.pushed.lock().unwrap().len(), 2);
        assert_eq!(channel.health().push.state, ChannelHealthState::Running);

        channel.shutdown().await;
        channel.shutdown().await;
    }
}
