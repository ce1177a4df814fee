//! Local write serialization
//!
//! Jobs wait per (documentId, scope, branch); at most one job per document
//! executes at a time. Workers of the [`JobExecutor`] turn mutate jobs into
//! operations at the head of the log and merge load jobs received from
//! remotes.

pub mod client;
pub mod errors;
pub mod executor;
pub mod job;
pub mod queue;
pub mod tracker;

pub use client::{JobClient, OperationLoader};
pub use errors::{JobError, JobResult};
pub use executor::{ExecutorConfig, JobExecutor, JobOutcome};
pub use job::{Job, JobInfo, JobKind, JobStatus};
pub use queue::InMemoryQueue;
pub use tracker::JobTracker;
