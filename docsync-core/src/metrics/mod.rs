//! Metrics for the operation log, job queue and sync channels
//!
//! Counters are recorded through the `metrics` facade; installing a recorder
//! (Prometheus, statsd, ...) is left to the embedding binary.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use std::time::Instant;

pub const OPERATIONS_APPLIED: &str = "docsync.store.operations_applied";
pub const REVISION_MISMATCHES: &str = "docsync.store.revision_mismatches";
pub const DUPLICATE_OPERATIONS: &str = "docsync.store.duplicate_operations";
pub const JOBS_COMPLETED: &str = "docsync.queue.jobs_completed";
pub const JOBS_FAILED: &str = "docsync.queue.jobs_failed";
pub const JOB_DURATION_MS: &str = "docsync.queue.job_duration_ms";
pub const RESHUFFLES: &str = "docsync.queue.reshuffles";
pub const ENVELOPES_SENT: &str = "docsync.sync.envelopes_sent";
pub const ENVELOPES_RECEIVED: &str = "docsync.sync.envelopes_received";
pub const POLL_FAILURES: &str = "docsync.sync.poll_failures";
pub const PUSH_FAILURES: &str = "docsync.sync.push_failures";
pub const DEAD_LETTERED: &str = "docsync.sync.dead_lettered";
pub const OUTBOX_DEPTH: &str = "docsync.sync.outbox_depth";
pub const INBOX_DEPTH: &str = "docsync.sync.inbox_depth";

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(OPERATIONS_APPLIED, "Operations appended to the operation log");
    describe_counter!(REVISION_MISMATCHES, "Writes rejected by the optimistic revision check");
    describe_counter!(DUPLICATE_OPERATIONS, "Writes rejected because an operation id already existed");

    describe_counter!(JOBS_COMPLETED, "Jobs executed successfully");
    describe_counter!(JOBS_FAILED, "Jobs that failed after exhausting retries");
    describe_histogram!(JOB_DURATION_MS, "Job execution time in milliseconds");
    describe_counter!(RESHUFFLES, "Loads that superseded local operations");

    describe_counter!(ENVELOPES_SENT, "Sync envelopes handed to a transport");
    describe_counter!(ENVELOPES_RECEIVED, "Sync envelopes received into an inbox");
    describe_counter!(POLL_FAILURES, "Failed poll cycles of request channels");
    describe_counter!(PUSH_FAILURES, "Failed pushes of request channels");
    describe_counter!(DEAD_LETTERED, "Sync operations moved to a dead-letter mailbox");
    describe_gauge!(OUTBOX_DEPTH, "Sync operations waiting in an outbox");
    describe_gauge!(INBOX_DEPTH, "Sync operations waiting in an inbox");
}

/// Records elapsed wall time into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer, record the duration and return it in milliseconds
    pub fn stop(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.name).record(elapsed_ms);
        elapsed_ms
    }
}
