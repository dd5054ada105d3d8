use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use kairos_core::{PoolState, TaskError};
use serde::Serialize;

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks currently executing.
    pub active: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    pub cancelled: u64,
    /// Submissions refused with `QueueFull` or `PoolStopped`.
    pub rejected: u64,
    /// Results not delivered because the result stream was full or gone.
    pub results_dropped: u64,
    /// Accepted tasks that never ran because of an abort.
    pub discarded: usize,
}

impl PoolStats {
    /// Tasks that ran to an outcome, whatever it was.
    pub fn executed(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out + self.panicked + self.cancelled
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub active: AtomicUsize,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub panicked: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub results_dropped: AtomicU64,
    pub discarded: AtomicUsize,
}

impl Counters {
    pub fn record(&self, outcome: &Result<(), TaskError>) {
        let counter = match outcome {
            Ok(()) => &self.succeeded,
            Err(TaskError::Failed(_)) => &self.failed,
            Err(TaskError::Timeout(_)) => &self.timed_out,
            Err(TaskError::Panic(_)) => &self.panicked,
            Err(TaskError::Cancelled) => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, state: PoolState, queued: usize) -> PoolStats {
        PoolStats {
            state,
            queued,
            active: self.active.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
