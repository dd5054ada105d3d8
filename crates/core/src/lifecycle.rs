use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of a pool, scheduler or pipeline.
///
/// Transitions are monotonic: `Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum PoolState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl PoolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// How a component should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShutdownMode {
    /// Stop accepting work, finish everything already accepted.
    Graceful,
    /// Cancel in-flight work and discard anything not yet started.
    Abort,
}

/// What a worker pool did between the start of shutdown and `Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks that ran to an outcome over the pool's lifetime.
    pub executed: u64,
    /// Queued tasks dropped without running (abort only).
    pub discarded: usize,
}

/// Atomic `Running -> Draining -> Stopped` state machine with a completion
/// signal carrying the shutdown outcome `R`.
///
/// Exactly one caller wins [`begin_shutdown`](Self::begin_shutdown); every
/// other caller waits on [`stopped`](Self::stopped) and receives the same `R`.
#[derive(Debug)]
pub struct Lifecycle<R = ()> {
    state: AtomicU8,
    done: watch::Sender<Option<R>>,
}

impl<R: Clone + Default> Lifecycle<R> {
    pub fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            state: AtomicU8::new(PoolState::Running as u8),
            done,
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Compare-and-set `Running -> Draining`. Returns `true` only for the caller
    /// that performed the transition.
    pub fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move `Draining -> Stopped` and publish the outcome. No-op unless draining.
    pub fn finish(&self, outcome: R) {
        let moved = self
            .state
            .compare_exchange(
                PoolState::Draining as u8,
                PoolState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            self.done.send_replace(Some(outcome));
        }
    }

    /// Wait until the component reaches `Stopped` and return its outcome.
    pub async fn stopped(&self) -> R {
        let mut rx = self.done.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_default()
    }
}

impl<R: Clone + Default> Default for Lifecycle<R> {
    fn default() -> Self {
        Self::new()
    }
}
