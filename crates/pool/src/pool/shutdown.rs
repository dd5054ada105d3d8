use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use kairos_core::{PoolState, Shutdown, ShutdownMode, ShutdownReport};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::core::{PoolShared, WorkerPool};

impl WorkerPool {
    /// Stop the pool.
    ///
    /// `Graceful` refuses new tasks and lets workers finish everything already
    /// queued. `Abort` also drops queued tasks and cancels running ones.
    /// Safe to call concurrently and repeatedly: one caller performs the
    /// shutdown, the others wait for it and get the same report. An `Abort`
    /// issued while a graceful drain is in progress escalates it.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        let shared = &self.shared;
        if shared.lifecycle.begin_shutdown() {
            info!(pool = %shared.name, ?mode, "Shutting down worker pool");
            match mode {
                ShutdownMode::Graceful => shared.queue.close(),
                ShutdownMode::Abort => self.abort_pending(),
            }
            // Detached: dropping this future must not leave the pool in `Draining`.
            let handles = std::mem::take(
                &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
            );
            self.runtime.spawn(drain(Arc::clone(shared), handles));
        } else if mode == ShutdownMode::Abort && shared.lifecycle.state() == PoolState::Draining {
            self.abort_pending();
        }
        shared.lifecycle.stopped().await
    }

    fn abort_pending(&self) {
        let drained = self.shared.queue.close_and_drain();
        self.shared
            .counters
            .discarded
            .fetch_add(drained.len(), Ordering::Relaxed);
        self.shared.token.cancel();
    }
}

/// Join every worker, account for tasks left in the queue and publish the
/// final report.
async fn drain(shared: Arc<PoolShared>, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(pool = %shared.name, "Worker task failed: {}", e);
        }
    }

    // Workers stopped by a parent cancellation leave their queue behind.
    let leftover = shared.queue.close_and_drain().len();
    shared.counters.discarded.fetch_add(leftover, Ordering::Relaxed);

    let stats = shared.stats();
    let report = ShutdownReport {
        executed: stats.executed(),
        discarded: stats.discarded,
    };
    shared.lifecycle.finish(report);
    info!(
        pool = %shared.name,
        executed = report.executed,
        discarded = report.discarded,
        "Worker pool stopped"
    );
}

#[async_trait]
impl Shutdown for WorkerPool {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn shutdown(&self, mode: ShutdownMode) {
        WorkerPool::shutdown(self, mode).await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.shared.lifecycle.state() != PoolState::Stopped {
            self.shared.queue.close_and_drain();
            self.shared.token.cancel();
        }
    }
}
