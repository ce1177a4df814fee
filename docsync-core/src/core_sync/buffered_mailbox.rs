//! Mailbox with debounced callbacks
//!
//! Storage changes apply immediately; callbacks are coalesced and fired once
//! the mailbox has been quiet for `window`, or as soon as `max_queued` items
//! are waiting. Bursts of local writes therefore turn into a single push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::trace;

use super::mailbox::{Dispatch, Mailbox, MailboxCallback, MailboxCore};
use super::sync_operation::SyncOperation;
use crate::config::SyncConfig;
use crate::core_store::Ordinal;

struct Inner {
    core: MailboxCore,
    window: Duration,
    max_queued: usize,
    generation: AtomicU64,
}

pub struct BufferedMailbox {
    inner: Arc<Inner>,
}

impl BufferedMailbox {
    pub fn new(window: Duration, max_queued: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: MailboxCore::default(),
                window,
                max_queued: max_queued.max(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.buffer_window, config.buffer_max_queued)
    }

    fn schedule(&self, queued: usize) {
        if queued >= self.inner.max_queued {
            trace!(queued, "buffer full, flushing");
            self.flush();
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            // No runtime to own a timer.
            Err(_) => return self.flush(),
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let window = self.inner.window;
        handle.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.core.dispatch();
                }
            }
        });
    }
}

impl Mailbox for BufferedMailbox {
    fn get(&self, id: &str) -> Option<Arc<SyncOperation>> {
        self.inner.core.get(id)
    }

    fn items(&self) -> Vec<Arc<SyncOperation>> {
        self.inner.core.items()
    }

    fn len(&self) -> usize {
        self.inner.core.len()
    }

    fn add(&self, items: Vec<Arc<SyncOperation>>) {
        if items.is_empty() {
            return;
        }
        self.inner.core.store(&items);
        let queued = self.inner.core.queue(Dispatch::Added(items));
        self.schedule(queued);
    }

    fn remove(&self, items: &[Arc<SyncOperation>]) {
        let removed = self.inner.core.discard(items);
        if removed.is_empty() {
            return;
        }
        let queued = self.inner.core.queue(Dispatch::Removed(removed));
        self.schedule(queued);
    }

    fn on_added(&self, callback: MailboxCallback) {
        self.inner.core.on_added(callback);
    }

    fn on_removed(&self, callback: MailboxCallback) {
        self.inner.core.on_removed(callback);
    }

    fn pause(&self) {
        self.inner.core.set_paused(true);
    }

    fn resume(&self) {
        self.inner.core.set_paused(false);
        self.flush();
    }

    fn is_paused(&self) -> bool {
        self.inner.core.is_paused()
    }

    fn init(&self, ack_ordinal: Ordinal) {
        self.inner.core.init(ack_ordinal);
    }

    fn ack_ordinal(&self) -> Ordinal {
        self.inner.core.ack_ordinal()
    }

    fn latest_ordinal(&self) -> Ordinal {
        self.inner.core.latest_ordinal()
    }

    fn acknowledge(&self, ordinal: Ordinal) {
        self.inner.core.acknowledge(ordinal);
    }

    fn flush(&self) {
        // Invalidate any armed timer.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.core.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::mailbox::tests::{recorder, sync_op};

    const WINDOW: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_wait_for_quiet_window() {
        let mailbox = BufferedMailbox::new(WINDOW, 100);
        let log = recorder(&mailbox);

        mailbox.add(vec![sync_op(1)]);
        assert_eq!(mailbox.len(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        mailbox.add(vec![sync_op(2)]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(log.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*log.lock().unwrap(), vec![("added", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_early_when_full() {
        let mailbox = BufferedMailbox::new(WINDOW, 3);
        let log = recorder(&mailbox);

        mailbox.add(vec![sync_op(1), sync_op(2)]);
        assert!(log.lock().unwrap().is_empty());
        mailbox.add(vec![sync_op(3)]);
        assert_eq!(*log.lock().unwrap(), vec![("added", 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_preserves_order() {
        let mailbox = BufferedMailbox::new(WINDOW, 100);
        let log = recorder(&mailbox);
        let op = sync_op(1);

        mailbox.add(vec![op.clone()]);
        mailbox.remove(&[op]);
        mailbox.flush();
        assert_eq!(*log.lock().unwrap(), vec![("added", 1), ("removed", 1)]);
        assert_eq!(mailbox.ack_ordinal(), 1);

        // The cancelled timer fires nothing further.
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_mailbox_holds_callbacks() {
        let mailbox = BufferedMailbox::new(WINDOW, 100);
        let log = recorder(&mailbox);

        mailbox.pause();
        mailbox.add(vec![sync_op(1)]);
        tokio::time::sleep(WINDOW * 2).await;
        assert!(log.lock().unwrap().is_empty());

        mailbox.resume();
        assert_eq!(*log.lock().unwrap(), vec![("added", 1)]);
    }

    #[test]
    fn test_without_runtime_dispatches_immediately() {
        let mailbox = BufferedMailbox::new(WINDOW, 100);
        let log = recorder(&mailbox);
        mailbox.add(vec![sync_op(1)]);
        assert_eq!(*log.lock().unwrap(), vec![("added", 1)]);
    }
}
