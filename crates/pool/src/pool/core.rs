use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use kairos_core::{
    Error, Lifecycle, NoopObserver, Observer, PoolConfig, PoolState, Result, ShutdownReport, Task,
    TaskContext, TaskError, TaskId, TaskResult,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::{Rejected, TaskQueue};
use crate::stats::{Counters, PoolStats};

use super::worker;

/// Stream of [`TaskResult`]s, available when `result_buffer > 0`.
/// Ends once every worker has exited.
pub type ResultStream = ReceiverStream<TaskResult>;

/// Invoked on the worker for every finished task.
pub type ResultCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// State shared between the pool handle and its workers.
pub(crate) struct PoolShared {
    pub name: String,
    pub config: PoolConfig,
    pub queue: TaskQueue,
    pub lifecycle: Lifecycle<ShutdownReport>,
    pub token: CancellationToken,
    pub counters: Counters,
    pub observer: Arc<dyn Observer>,
    pub on_result: Option<ResultCallback>,
}

impl PoolShared {
    pub fn stats(&self) -> PoolStats {
        self.counters
            .snapshot(self.lifecycle.state(), self.queue.len())
    }
}

/// A fixed set of async workers draining a bounded task queue.
///
/// ```no_run
/// # async fn demo() -> kairos_core::Result<()> {
/// use kairos_core::{PoolConfig, ShutdownMode};
/// use kairos_pool::WorkerPool;
///
/// let pool = WorkerPool::new(PoolConfig::new(4, 16))?;
/// pool.spawn(|_ctx| async { Ok(()) })?;
/// pool.shutdown(ShutdownMode::Graceful).await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    pub(crate) shared: Arc<PoolShared>,
    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) runtime: Handle,
    results: Mutex<Option<ResultStream>>,
}

impl WorkerPool {
    /// Start a pool with default name and no observer.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: PoolConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(config)
    }

    /// Enqueue a task without waiting.
    ///
    /// Fails with [`Error::QueueFull`] when no idle worker or queue slot is
    /// free, and with [`Error::PoolStopped`] once shutdown has begun.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        if !self.shared.lifecycle.is_running() {
            return Err(self.reject(Error::PoolStopped));
        }
        let task_id = task.id();
        match self.shared.queue.try_push(task) {
            Ok(depth) => Ok(self.accepted(task_id, depth)),
            Err(Rejected::Full(_)) => Err(self.reject(Error::QueueFull {
                capacity: self.shared.queue.capacity(),
            })),
            Err(Rejected::Closed(_)) => Err(self.reject(Error::PoolStopped)),
        }
    }

    /// Enqueue a task, waiting for room.
    ///
    /// Resolves with [`Error::Cancelled`] if `cancel` fires first; the task is
    /// then dropped without running.
    pub async fn submit_wait(&self, task: Task, cancel: &CancellationToken) -> Result<TaskId> {
        if !self.shared.lifecycle.is_running() {
            return Err(self.reject(Error::PoolStopped));
        }
        let task_id = task.id();
        let pushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.shared.token.cancelled() => return Err(self.reject(Error::PoolStopped)),
            pushed = self.shared.queue.push(task) => pushed,
        };
        match pushed {
            Ok(depth) => Ok(self.accepted(task_id, depth)),
            Err(Rejected::Full(_) | Rejected::Closed(_)) => Err(self.reject(Error::PoolStopped)),
        }
    }

    /// Build a task from an async closure and [`submit`](Self::submit) it.
    pub fn spawn<F, Fut>(&self, work: F) -> Result<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.submit(Task::new(work))
    }

    fn accepted(&self, task_id: TaskId, depth: usize) -> TaskId {
        debug!(pool = %self.shared.name, task = %task_id, depth, "Task queued");
        self.shared.observer.on_queue_depth(&self.shared.name, depth);
        task_id
    }

    fn reject(&self, err: Error) -> Error {
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        self.shared.observer.on_submit_rejected(&self.shared.name, &err);
        debug!(pool = %self.shared.name, "Submit rejected: {}", err);
        err
    }

    /// Take the result stream. Returns `None` if it was already taken or the
    /// pool was built with `result_buffer = 0`.
    pub fn take_results(&self) -> Option<ResultStream> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PoolState {
        self.shared.lifecycle.state()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    name: String,
    observer: Arc<dyn Observer>,
    on_result: Option<ResultCallback>,
    parent_token: Option<CancellationToken>,
}

impl WorkerPoolBuilder {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            name: "pool".to_string(),
            observer: Arc::new(NoopObserver),
            on_result: None,
            parent_token: None,
        }
    }

    /// Name used in logs and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Register a callback run for every finished task. A panicking callback
    /// is logged and otherwise ignored.
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(callback));
        self
    }

    /// Cancelling `token` cancels every task running in the pool and stops
    /// its workers.
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = Some(token);
        self
    }

    /// Validate the config and spawn the workers on the current runtime.
    pub fn build(self) -> Result<WorkerPool> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let token = match self.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let (result_tx, results) = if self.config.result_buffer > 0 {
            let (tx, rx) = mpsc::channel(self.config.result_buffer);
            (Some(tx), Some(ReceiverStream::new(rx)))
        } else {
            (None, None)
        };

        let worker_count = self.config.worker_count;
        let shared = Arc::new(PoolShared {
            name: self.name,
            queue: TaskQueue::new(self.config.queue_size),
            config: self.config,
            lifecycle: Lifecycle::new(),
            token,
            counters: Counters::default(),
            observer: self.observer,
            on_result: self.on_result,
        });

        let handles = (0..worker_count)
            .map(|index| runtime.spawn(worker::run(Arc::clone(&shared), index, result_tx.clone())))
            .collect();

        info!(
            pool = %shared.name,
            workers = worker_count,
            queue_size = shared.config.queue_size,
            "Worker pool started"
        );

        Ok(WorkerPool {
            shared,
            handles: Mutex::new(handles),
            runtime,
            results: Mutex::new(results),
        })
    }
}
