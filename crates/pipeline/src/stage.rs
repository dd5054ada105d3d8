use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use kairos_core::{run_guarded, Observer, StageSettings, TaskContext, TaskError, TaskId, TaskResult};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sink::{ErrorSink, StageError};

/// A stage's item transform.
pub type Transform<In, Out> =
    Arc<dyn Fn(In) -> BoxFuture<'static, Result<Out, TaskError>> + Send + Sync>;

/// One pipeline step: a named transform plus its sizing.
pub struct StageSpec<In, Out> {
    pub(crate) settings: StageSettings,
    pub(crate) transform: Transform<In, Out>,
}

impl<In, Out> StageSpec<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// A single-worker stage with the default input buffer.
    pub fn new<F, Fut>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, TaskError>> + Send + 'static,
    {
        Self {
            settings: StageSettings::new(name),
            transform: Arc::new(move |item: In| -> BoxFuture<'static, Result<Out, TaskError>> {
                Box::pin(transform(item))
            }),
        }
    }

    /// Parallel workers. More than one may reorder items.
    pub fn workers(mut self, count: usize) -> Self {
        self.settings.worker_count = count;
        self
    }

    /// Bound of the channel feeding this stage.
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.settings.buffer = capacity;
        self
    }

    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.settings.item_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Replace sizing wholesale.
    pub fn with_settings(mut self, settings: StageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }
}

impl<In, Out> fmt::Debug for StageSpec<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Per-stage item counters.
#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
}

/// Item counts for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub name: String,
    /// Items transformed and passed downstream.
    pub processed: u64,
    /// Items routed to the error sink.
    pub failed: u64,
}

impl StageReport {
    pub(crate) fn from_counters(name: &str, counters: &StageCounters) -> Self {
        Self {
            name: name.to_string(),
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// State of one long-running worker task inside a stage's pool.
pub(crate) struct StageWorker<In, Out> {
    pub index: usize,
    pub name: String,
    pub input: Arc<Mutex<mpsc::Receiver<In>>>,
    pub output: mpsc::Sender<Out>,
    pub transform: Transform<In, Out>,
    pub item_timeout: Option<Duration>,
    pub errors: ErrorSink,
    pub counters: Arc<StageCounters>,
    /// Metrics key for this stage, `pipeline/stage`.
    pub pool: String,
    pub observer: Arc<dyn Observer>,
}

impl<In, Out> StageWorker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Pull, transform, push until the input ends or the stage is cancelled.
    pub async fn run(self, ctx: TaskContext) -> Result<(), TaskError> {
        debug!(stage = %self.name, task = %ctx.task_id(), "Stage worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                item = async { self.input.lock().await.recv().await } => item,
            };
            let Some(item) = next else { break };

            let item_id = TaskId::next();
            let item_token = ctx.token().child_token();
            let transform = &self.transform;
            let started = Instant::now();
            let outcome = run_guarded(
                async move { transform(item).await },
                &item_token,
                self.item_timeout,
            )
            .await;
            let reported = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
            self.observe(item_id, started.elapsed(), reported);

            match outcome {
                Ok(out) => {
                    let sent = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        sent = self.output.send(out) => sent,
                    };
                    if sent.is_err() {
                        warn!(stage = %self.name, "Downstream closed, stage worker exiting");
                        break;
                    }
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(TaskError::Cancelled) if ctx.is_cancelled() => break,
                Err(error) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        stage = %self.name,
                        item = %item_id,
                        kind = error.kind(),
                        "Item failed: {}",
                        error
                    );
                    self.errors.report(StageError {
                        stage: self.index,
                        stage_name: self.name.clone(),
                        error,
                    });
                }
            }
        }

        debug!(stage = %self.name, task = %ctx.task_id(), "Stage worker exiting");
        Ok(())
    }

    /// Report one item's transform to the observer.
    fn observe(&self, task_id: TaskId, duration: Duration, outcome: Result<(), TaskError>) {
        let result = TaskResult {
            task_id,
            name: Some(self.name.clone()),
            outcome,
            duration,
        };
        self.observer.on_task_finished(&self.pool, &result);
    }
}
