//! Execution bounds supplied by the caller.
//!
//! These are the only "configuration" this crate owns. Loading them from a
//! file or environment, and enforcing tenant-level quotas on top of them,
//! is the caller's job — out of scope here (see `SPEC_FULL.md` §1).

use std::time::Duration;

/// Hard bounds on a single run, checked by the driver and by [`crate::worker_pool::WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum number of node starts before the run is aborted.
    pub max_execution_steps: u64,
    /// Maximum wall-clock duration of the run.
    pub max_execution_time: Duration,
    /// Number of worker slots available for parallel branch dispatch.
    pub max_workers: usize,
    /// Hard cap on the number of branch tasks that may ever be submitted
    /// to the worker pool over the lifetime of a run.
    pub max_submit_count: usize,
}

impl Default for ExecutionLimits {
    /// Mirrors the originating platform's defaults: generous step count,
    /// a few minutes of wall clock, ten workers.
    fn default() -> Self {
        Self {
            max_execution_steps: 500,
            max_execution_time: Duration::from_secs(1200),
            max_workers: 10,
            max_submit_count: 100,
        }
    }
}

impl ExecutionLimits {
    /// Build limits with every bound explicit — useful in tests where the
    /// defaults would hide an off-by-one.
    pub fn new(
        max_execution_steps: u64,
        max_execution_time: Duration,
        max_workers: usize,
        max_submit_count: usize,
    ) -> Self {
        Self {
            max_execution_steps,
            max_execution_time,
            max_workers,
            max_submit_count,
        }
    }
}
