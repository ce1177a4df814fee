//! Mailboxes: the inbox, outbox and dead-letter queues of a channel
//!
//! Items are keyed by sync operation id and kept in insertion order. Each
//! `add`/`remove` batch fires one callback per registered listener, in
//! registration order. A mailbox also tracks two ordinals: `ack` (everything
//! at or below it is settled) and `latest` (the highest ordinal ever added).

use hashlink::LinkedHashMap;
use std::sync::{Arc, Mutex};

use super::sync_operation::SyncOperation;
use crate::core_store::Ordinal;
use crate::lock;

pub type MailboxCallback = Arc<dyn Fn(&[Arc<SyncOperation>]) + Send + Sync>;

pub trait Mailbox: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<SyncOperation>>;

    /// Snapshot in insertion order
    fn items(&self) -> Vec<Arc<SyncOperation>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a batch; an item whose id is already present replaces it
    fn add(&self, items: Vec<Arc<SyncOperation>>);

    /// Remove a batch. The ack ordinal advances to the highest removed
    /// ordinal that no remaining item precedes.
    fn remove(&self, items: &[Arc<SyncOperation>]);

    fn on_added(&self, callback: MailboxCallback);

    fn on_removed(&self, callback: MailboxCallback);

    /// Hold back callbacks until `resume`
    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Restore the cursor position after a restart
    fn init(&self, ack_ordinal: Ordinal);

    fn ack_ordinal(&self) -> Ordinal;

    fn latest_ordinal(&self) -> Ordinal;

    /// Raise the ack ordinal; lower values are ignored
    fn acknowledge(&self, ordinal: Ordinal);

    /// Dispatch deferred callbacks now
    fn flush(&self) {}
}

#[derive(Clone)]
pub(crate) enum Dispatch {
    Added(Vec<Arc<SyncOperation>>),
    Removed(Vec<Arc<SyncOperation>>),
}

impl Dispatch {
    fn len(&self) -> usize {
        match self {
            Dispatch::Added(items) | Dispatch::Removed(items) => items.len(),
        }
    }
}

#[derive(Default)]
struct Contents {
    items: LinkedHashMap<String, Arc<SyncOperation>>,
    ack: Ordinal,
    latest: Ordinal,
}

#[derive(Default)]
struct Callbacks {
    added: Vec<MailboxCallback>,
    removed: Vec<MailboxCallback>,
}

#[derive(Default)]
struct Pending {
    paused: bool,
    batches: Vec<Dispatch>,
}

/// Storage, ordinals and callback dispatch shared by both mailbox kinds
#[derive(Default)]
pub(crate) struct MailboxCore {
    contents: Mutex<Contents>,
    callbacks: Mutex<Callbacks>,
    pending: Mutex<Pending>,
}

impl MailboxCore {
    pub(crate) fn get(&self, id: &str) -> Option<Arc<SyncOperation>> {
        lock(&self.contents).items.get(id).cloned()
    }

    pub(crate) fn items(&self) -> Vec<Arc<SyncOperation>> {
        lock(&self.contents).items.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.contents).items.len()
    }

    pub(crate) fn store(&self, items: &[Arc<SyncOperation>]) {
        let mut contents = lock(&self.contents);
        for item in items {
            contents.latest = contents.latest.max(item.ordinal());
            contents.items.insert(item.id.clone(), item.clone());
        }
    }

    /// Drop `items` and return the ones that were present
    pub(crate) fn discard(&self, items: &[Arc<SyncOperation>]) -> Vec<Arc<SyncOperation>> {
        let mut contents = lock(&self.contents);
        let removed: Vec<Arc<SyncOperation>> = items
            .iter()
            .filter_map(|item| contents.items.remove(&item.id))
            .collect();

        if let Some(highest) = removed.iter().map(|item| item.ordinal()).max() {
            let settled = match contents.items.values().map(|item| item.ordinal()).min() {
                Some(lowest) => highest.min(lowest.saturating_sub(1)),
                None => highest,
            };
            contents.ack = contents.ack.max(settled);
        }
        removed
    }

    pub(crate) fn init(&self, ack_ordinal: Ordinal) {
        let mut contents = lock(&self.contents);
        contents.ack = ack_ordinal;
        contents.latest = contents.latest.max(ack_ordinal);
    }

    pub(crate) fn ack_ordinal(&self) -> Ordinal {
        lock(&self.contents).ack
    }

    pub(crate) fn latest_ordinal(&self) -> Ordinal {
        lock(&self.contents).latest
    }

    pub(crate) fn acknowledge(&self, ordinal: Ordinal) {
        let mut contents = lock(&self.contents);
        contents.ack = contents.ack.max(ordinal);
        contents.latest = contents.latest.max(ordinal);
    }

    pub(crate) fn on_added(&self, callback: MailboxCallback) {
        lock(&self.callbacks).added.push(callback);
    }

    pub(crate) fn on_removed(&self, callback: MailboxCallback) {
        lock(&self.callbacks).removed.push(callback);
    }

    /// Queue a batch for dispatch, merging it into the previous batch of the
    /// same kind. Returns the number of queued items.
    pub(crate) fn queue(&self, dispatch: Dispatch) -> usize {
        let mut pending = lock(&self.pending);
        match (pending.batches.last_mut(), dispatch) {
            (Some(Dispatch::Added(last)), Dispatch::Added(items)) => last.extend(items),
            (Some(Dispatch::Removed(last)), Dispatch::Removed(items)) => last.extend(items),
            (_, dispatch) => pending.batches.push(dispatch),
        }
        pending.batches.iter().map(Dispatch::len).sum()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        lock(&self.pending).paused = paused;
    }

    pub(crate) fn is_paused(&self) -> bool {
        lock(&self.pending).paused
    }

    /// Fire every queued batch unless paused
    pub(crate) fn dispatch(&self) {
        let batches = {
            let mut pending = lock(&self.pending);
            if pending.paused {
                return;
            }
            std::mem::take(&mut pending.batches)
        };

        for batch in batches {
            let (callbacks, items) = match &batch {
                Dispatch::Added(items) => (lock(&self.callbacks).added.clone(), items),
                Dispatch::Removed(items) => (lock(&self.callbacks).removed.clone(), items),
            };
            if items.is_empty() {
                continue;
            }
            for callback in callbacks {
                callback(items);
            }
        }
    }
}

/// Mailbox whose callbacks fire synchronously with each change
#[derive(Default)]
pub struct InMemoryMailbox {
    core: MailboxCore,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for InMemoryMailbox {
    fn get(&self, id: &str) -> Option<Arc<SyncOperation>> {
        self.core.get(id)
    }

    fn items(&self) -> Vec<Arc<SyncOperation>> {
        self.core.items()
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn add(&self, items: Vec<Arc<SyncOperation>>) {
        if items.is_empty() {
            return;
        }
        self.core.store(&items);
        self.core.queue(Dispatch::Added(items));
        self.core.dispatch();
    }

    fn remove(&self, items: &[Arc<SyncOperation>]) {
        let removed = self.core.discard(items);
        if removed.is_empty() {
            return;
        }
        self.core.queue(Dispatch::Removed(removed));
        self.core.dispatch();
    }

    fn on_added(&self, callback: MailboxCallback) {
        self.core.on_added(callback);
    }

    fn on_removed(&self, callback: MailboxCallback) {
        self.core.on_removed(callback);
    }

    fn pause(&self) {
        self.core.set_paused(true);
    }

    fn resume(&self) {
        self.core.set_paused(false);
        self.core.dispatch();
    }

    fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    fn init(&self, ack_ordinal: Ordinal) {
        self.core.init(ack_ordinal);
    }

    fn ack_ordinal(&self) -> Ordinal {
        self.core.ack_ordinal()
    }

    fn latest_ordinal(&self) -> Ordinal {
        self.core.latest_ordinal()
    }

    fn acknowledge(&self, ordinal: Ordinal) {
        self.core.acknowledge(ordinal);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_store::{OperationContext, OperationWithContext};
    use crate::test_utils::fixtures::make_operation;

    pub(crate) fn sync_op(ordinal: Ordinal) -> Arc<SyncOperation> {
        let item = OperationWithContext {
            operation: make_operation(0, &format!("a{}", ordinal), ordinal),
            context: OperationContext {
                document_id: "doc".into(),
                document_type: "counter".into(),
                scope: "global".into(),
                branch: "main".into(),
                ordinal,
            },
        };
        Arc::new(SyncOperation::new("remote", "doc", "main", vec![item]))
    }

    pub(crate) fn recorder(mailbox: &dyn Mailbox) -> Arc<Mutex<Vec<(&'static str, usize)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let added = log.clone();
        mailbox.on_added(Arc::new(move |items| added.lock().unwrap().push(("added", items.len()))));
        let removed = log.clone();
        mailbox.on_removed(Arc::new(move |items| removed.lock().unwrap().push(("removed", items.len()))));
        log
    }

    #[test]
    fn test_add_get_remove() {
        let mailbox = InMemoryMailbox::new();
        let (a, b) = (sync_op(1), sync_op(2));
        mailbox.add(vec![a.clone(), b.clone()]);

        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.get(&b.id).unwrap().id, b.id);
        assert_eq!(mailbox.latest_ordinal(), 2);

        mailbox.remove(&[a.clone()]);
        assert!(mailbox.get(&a.id).is_none());
        assert_eq!(mailbox.items().len(), 1);
    }

    #[test]
    fn test_callbacks_fire_once_per_batch_in_order() {
        let mailbox = InMemoryMailbox::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let sink = order.clone();
            mailbox.on_added(Arc::new(move |_| sink.lock().unwrap().push(n)));
        }

        mailbox.add(vec![sync_op(1), sync_op(2)]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ack_stops_below_remaining_items() {
        let mailbox = InMemoryMailbox::new();
        let (one, two, three) = (sync_op(1), sync_op(2), sync_op(3));
        mailbox.add(vec![one.clone(), two.clone(), three.clone()]);

        mailbox.remove(&[three.clone()]);
        assert_eq!(mailbox.ack_ordinal(), 0);

        mailbox.remove(&[one.clone()]);
        assert_eq!(mailbox.ack_ordinal(), 1);

        mailbox.remove(&[two.clone()]);
        assert_eq!(mailbox.ack_ordinal(), 3);
    }

    #[test]
    fn test_pause_buffers_until_resume() {
        let mailbox = InMemoryMailbox::new();
        let log = recorder(&mailbox);
        let op = sync_op(1);

        mailbox.pause();
        mailbox.add(vec![op.clone()]);
        mailbox.add(vec![sync_op(2)]);
        mailbox.remove(&[op]);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(mailbox.len(), 1);

        mailbox.resume();
        assert_eq!(*log.lock().unwrap(), vec![("added", 2), ("removed", 1)]);
    }

    #[test]
    fn test_init_and_acknowledge() {
        let mailbox = InMemoryMailbox::new();
        mailbox.init(10);
        assert_eq!(mailbox.ack_ordinal(), 10);
        assert_eq!(mailbox.latest_ordinal(), 10);

        mailbox.acknowledge(4);
        assert_eq!(mailbox.ack_ordinal(), 10);
        mailbox.acknowledge(12);
        assert_eq!(mailbox.ack_ordinal(), 12);
    }

    #[test]
    fn test_removing_unknown_item_is_silent() {
        let mailbox = InMemoryMailbox::new();
        let log = recorder(&mailbox);
        mailbox.remove(&[sync_op(5)]);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(mailbox.ack_ordinal(), 0);
    }
}
