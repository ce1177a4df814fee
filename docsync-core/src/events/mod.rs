//! Typed publish/subscribe bus
//!
//! Topics are a closed enum. Handlers are synchronous and run on the emitting
//! thread in subscription order; they must not block. A [`Subscription`]
//! removes its handler when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

use crate::core_store::OperationWithContext;
use crate::core_sync::SyncOperationStatus;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JobPending,
    JobRunning,
    JobCompleted,
    JobFailed,
    OperationsWritten,
    SyncStatusChanged,
    SyncDeadLetter,
}

/// Operations appended to the log by one job
#[derive(Debug, Clone)]
pub struct OperationsWritten {
    pub job_id: String,
    pub job_dependencies: Vec<String>,
    pub document_id: String,
    pub branch: String,
    pub operations: Vec<OperationWithContext>,
    /// Remote the operations were loaded from; `None` for local writes and
    /// for reshuffles, which every remote must see
    pub source_remote: Option<String>,
    pub reshuffled: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    JobPending {
        job_id: String,
        document_id: String,
    },
    JobRunning {
        job_id: String,
        document_id: String,
    },
    JobCompleted {
        job_id: String,
        document_id: String,
        operation_count: usize,
    },
    JobFailed {
        job_id: String,
        document_id: String,
        error: String,
    },
    OperationsWritten(OperationsWritten),
    SyncStatusChanged {
        sync_operation_id: String,
        remote_name: String,
        document_id: String,
        previous: SyncOperationStatus,
        status: SyncOperationStatus,
    },
    SyncDeadLetter {
        sync_operation_id: String,
        remote_name: String,
        document_id: String,
        error: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::JobPending { .. } => Topic::JobPending,
            Event::JobRunning { .. } => Topic::JobRunning,
            Event::JobCompleted { .. } => Topic::JobCompleted,
            Event::JobFailed { .. } => Topic::JobFailed,
            Event::OperationsWritten(_) => Topic::OperationsWritten,
            Event::SyncStatusChanged { .. } => Topic::SyncStatusChanged,
            Event::SyncDeadLetter { .. } => Topic::SyncDeadLetter,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<Topic, Vec<(u64, Handler)>>>,
}

impl Registry {
    fn remove(&self, topic: Topic, id: u64) {
        if let Some(list) = lock(&self.handlers).get_mut(&topic) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.handlers)
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            topic,
            id,
        }
    }

    /// Deliver `event` to every handler of its topic
    pub fn emit(&self, event: Event) {
        let topic = event.topic();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = lock(&self.registry.handlers)
            .get(&topic)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        trace!(?topic, handlers = handlers.len(), "emit");
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        lock(&self.registry.handlers).get(&topic).map(Vec::len).unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::subscribe`]
pub struct Subscription {
    registry: Weak<Registry>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn failed(job: &str) -> Event {
        Event::JobFailed {
            job_id: job.into(),
            document_id: "doc".into(),
            error: "boom".into(),
        }
    }

    #[test]
    fn test_handlers_receive_only_their_topic() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let _sub = bus.subscribe(Topic::JobFailed, move |event| {
            assert_eq!(event.topic(), Topic::JobFailed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(failed("j1"));
        bus.emit(Event::JobPending {
            job_id: "j2".into(),
            document_id: "doc".into(),
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        let _a = bus.subscribe(Topic::JobFailed, move |_| first.lock().unwrap().push(1));
        let second = order.clone();
        let _b = bus.subscribe(Topic::JobFailed, move |_| second.lock().unwrap().push(2));

        bus.emit(failed("j"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_drop_and_unsubscribe_remove_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = bus.subscribe(Topic::JobFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(Topic::JobFailed), 1);

        sub.unsubscribe();
        bus.emit(failed("j"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        {
            let _scoped = bus.subscribe(Topic::JobFailed, |_| {});
            assert_eq!(bus.subscriber_count(Topic::JobFailed), 1);
        }
        assert_eq!(bus.subscriber_count(Topic::JobFailed), 0);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::JobPending, |_| {});
        drop(bus);
        drop(sub);
    }
}
