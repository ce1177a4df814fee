//! The reactor: one replica of the document store
//!
//! [`Reactor`] is the facade callers use to create, mutate and read
//! documents. [`ReactorBuilder`] wires the stores, the job queue and its
//! workers and, when enabled, the sync manager.

pub mod builder;
pub mod errors;
pub mod reactor;

pub use builder::ReactorBuilder;
pub use errors::{ReactorError, ReactorResult};
pub use reactor::Reactor;
