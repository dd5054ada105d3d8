use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use kairos_core::{run_guarded, Task, TaskContext, TaskError, TaskResult};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::core::PoolShared;

/// Worker loop: take tasks until the queue is closed and empty, or the
/// pool is cancelled.
pub(crate) async fn run(
    shared: Arc<PoolShared>,
    index: usize,
    results: Option<mpsc::Sender<TaskResult>>,
) {
    debug!(pool = %shared.name, worker = index, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.token.cancelled() => None,
            task = shared.queue.pop() => task,
        };
        let Some(task) = next else { break };

        if shared.token.is_cancelled() {
            shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %shared.name, task = %task.id(), "Discarding task after abort");
            break;
        }

        shared
            .observer
            .on_queue_depth(&shared.name, shared.queue.len());
        execute(&shared, task, results.as_ref()).await;
    }

    debug!(pool = %shared.name, worker = index, "Worker exiting");
}

async fn execute(shared: &PoolShared, task: Task, results: Option<&mpsc::Sender<TaskResult>>) {
    let task_id = task.id();
    let name = task.name().map(str::to_owned);
    let timeout = shared.config.task_timeout();
    let token = shared.token.child_token();
    let ctx = TaskContext::new(task_id, token.clone(), timeout.map(|t| Instant::now() + t));

    let active = shared.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
    shared.observer.on_active_workers(&shared.name, active);

    let started = Instant::now();
    // Build the body's future inside the guard so a panic in the closure
    // itself is caught too.
    let outcome = run_guarded(async move { task.start(ctx).await }, &token, timeout).await;
    let duration = started.elapsed();

    let active = shared.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
    shared.observer.on_active_workers(&shared.name, active);
    shared.counters.record(&outcome);

    match &outcome {
        Ok(()) => debug!(pool = %shared.name, task = %task_id, ?duration, "Task completed"),
        Err(TaskError::Panic(msg)) => {
            error!(pool = %shared.name, task = %task_id, "Task panicked: {}", msg)
        }
        Err(err) => warn!(
            pool = %shared.name,
            task = %task_id,
            kind = err.kind(),
            "Task did not complete: {}",
            err
        ),
    }

    let result = TaskResult {
        task_id,
        name,
        outcome,
        duration,
    };
    shared.observer.on_task_finished(&shared.name, &result);

    if let Some(callback) = &shared.on_result {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
            error!(pool = %shared.name, task = %task_id, "Result callback panicked");
        }
    }

    if let Some(tx) = results {
        if let Err(err) = tx.try_send(result) {
            shared.counters.results_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %shared.name, task = %task_id, "Result dropped: {}", err);
        }
    }
}
