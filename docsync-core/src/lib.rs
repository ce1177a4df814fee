//! docsync: an operation-log document store that replicates between reactors
//!
//! Each [`Reactor`] keeps an append-only operation log per document scope and
//! branch, serializes local writes through a per-document job queue and
//! exchanges operations with remotes over sync channels, reshuffling
//! concurrent histories into one order.

pub mod config;
pub mod core_model;
pub mod core_queue;
pub mod core_reactor;
pub mod core_store;
pub mod core_sync;
pub mod core_view;
pub mod events;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::{Config, ConfigError};
pub use core_reactor::{Reactor, ReactorBuilder, ReactorError, ReactorResult};
pub use events::{Event, EventBus, Subscription, Topic};
pub use logging::{init_logging, LogLevel};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = ReactorBuilder::new();
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoned.lock().unwrap();
            panic!("poison");
        })
        .join();

        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
