//! Multi-stage pipeline over per-stage worker pools.
//!
//! Stage *i* reads from a bounded channel that stage *i-1* writes to, so a
//! full buffer stalls the producer rather than dropping items. Closing the
//! head lets each stage drain in order; cancelling tears every stage down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kairos_core::{
    Error, Lifecycle, NoopObserver, Observer, PipelineSettings, PoolConfig, PoolState, Result,
    Shutdown, ShutdownMode,
};
use kairos_pool::WorkerPool;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::sink::{ErrorSink, StageError};
use crate::stage::{StageCounters, StageReport, StageSpec, StageWorker};

/// Terminal output of a pipeline. Finite once the head is closed.
pub type OutputStream<Out> = ReceiverStream<Out>;

/// Error sink stream. Ends when every stage has exited.
pub type ErrorStream = ReceiverStream<StageError>;

/// Outcome of [`Pipeline::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    /// Errors that did not fit in the error sink.
    pub dropped_errors: u64,
    pub cancelled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Assembly ──────────────────────────────────────────────────

struct StageHandle {
    name: String,
    pool: WorkerPool,
    counters: Arc<StageCounters>,
}

/// Build-time context: starts stage pools and records them in order.
struct Assembly {
    pipeline: String,
    settings: PipelineSettings,
    token: CancellationToken,
    observer: Arc<dyn Observer>,
    errors: ErrorSink,
    stages: Vec<StageHandle>,
}

impl Assembly {
    /// Apply a by-name override from the pipeline settings, then validate.
    fn resolve<I, O>(&self, spec: &mut StageSpec<I, O>) -> Result<()> {
        if let Some(settings) = self.settings.stage(&spec.settings.name) {
            spec.settings = settings.clone();
        }
        spec.settings.validate()
    }

    fn start<I, O>(
        &mut self,
        spec: StageSpec<I, O>,
        input: mpsc::Receiver<I>,
        output: mpsc::Sender<O>,
    ) -> Result<()>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let index = self.stages.len();
        let settings = spec.settings;
        let workers = settings.worker_count;

        let pool_name = format!("{}/{}", self.pipeline, settings.name);
        let pool = WorkerPool::builder(PoolConfig::new(workers, workers))
            .name(pool_name.clone())
            .parent_token(self.token.clone())
            .build()?;

        let input = Arc::new(tokio::sync::Mutex::new(input));
        let counters = Arc::new(StageCounters::default());
        for _ in 0..workers {
            let worker = StageWorker {
                index,
                name: settings.name.clone(),
                input: Arc::clone(&input),
                output: output.clone(),
                transform: Arc::clone(&spec.transform),
                item_timeout: settings.item_timeout(),
                errors: self.errors.clone(),
                counters: Arc::clone(&counters),
                pool: pool_name.clone(),
                observer: Arc::clone(&self.observer),
            };
            pool.spawn(move |ctx| worker.run(ctx))?;
        }

        info!(
            pipeline = %self.pipeline,
            stage = %settings.name,
            index,
            workers,
            buffer = settings.buffer,
            "Stage started"
        );
        self.stages.push(StageHandle {
            name: settings.name,
            pool,
            counters,
        });
        Ok(())
    }
}

/// Starts the stages so far given the sender they should write to, and
/// returns the head sender.
type Launch<In, Out> =
    Box<dyn FnOnce(&mut Assembly, mpsc::Sender<Out>) -> Result<mpsc::Sender<In>> + Send>;

// ── Builder ───────────────────────────────────────────────────

/// Typed builder; each [`stage`](Self::stage) may change the output type.
pub struct PipelineBuilder<In, Out> {
    name: String,
    settings: PipelineSettings,
    observer: Arc<dyn Observer>,
    launch: Launch<In, Out>,
}

impl<In, Out> PipelineBuilder<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn new(first: StageSpec<In, Out>) -> Self {
        let mut first = first;
        let launch = move |asm: &mut Assembly, output: mpsc::Sender<Out>| -> Result<mpsc::Sender<In>> {
            asm.resolve(&mut first)?;
            let (head, input) = mpsc::channel(first.settings.buffer);
            asm.start(first, input, output)?;
            Ok(head)
        };
        Self {
            name: "pipeline".to_string(),
            settings: PipelineSettings::default(),
            observer: Arc::new(NoopObserver),
            launch: Box::new(launch),
        }
    }

    /// Append a stage fed by the current last stage.
    pub fn stage<Next>(self, next: StageSpec<Out, Next>) -> PipelineBuilder<In, Next>
    where
        Next: Send + 'static,
    {
        let prev = self.launch;
        let mut next = next;
        let launch = move |asm: &mut Assembly, output: mpsc::Sender<Next>| -> Result<mpsc::Sender<In>> {
            asm.resolve(&mut next)?;
            // the link is created first so upstream stages start (and are
            // recorded) before this one
            let (link, input) = mpsc::channel(next.settings.buffer);
            let head = prev(asm, link)?;
            asm.start(next, input, output)?;
            Ok(head)
        };
        PipelineBuilder {
            name: self.name,
            settings: self.settings,
            observer: self.observer,
            launch: Box::new(launch),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Observer told about every item a stage transforms, keyed by
    /// `pipeline/stage`.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate and start every stage on the current runtime.
    pub fn build(self) -> Result<Pipeline<In, Out>> {
        self.settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let token = CancellationToken::new();
        let dropped_errors = Arc::new(AtomicU64::new(0));
        let (error_tx, error_rx) = mpsc::channel(self.settings.error_buffer);
        let (output_tx, output_rx) = mpsc::channel(self.settings.output_buffer);

        let mut asm = Assembly {
            pipeline: self.name.clone(),
            settings: self.settings,
            token: token.clone(),
            observer: self.observer,
            errors: ErrorSink::new(error_tx, Arc::clone(&dropped_errors)),
            stages: Vec::new(),
        };
        let head = match (self.launch)(&mut asm, output_tx) {
            Ok(head) => head,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };
        let Assembly { stages, .. } = asm;

        info!(pipeline = %self.name, stages = stages.len(), "Pipeline started");
        Ok(Pipeline {
            shared: Arc::new(PipelineShared {
                name: self.name,
                stages,
                dropped_errors,
                token,
                lifecycle: Lifecycle::new(),
            }),
            head: Mutex::new(Some(head)),
            output: Mutex::new(Some(ReceiverStream::new(output_rx))),
            errors: Mutex::new(Some(ReceiverStream::new(error_rx))),
            draining: AtomicBool::new(false),
            runtime,
        })
    }
}

// ── Pipeline ──────────────────────────────────────────────────

/// An ordered chain of pool-backed stages connected by bounded channels.
///
/// Items keep their order end-to-end when every stage has a single worker;
/// stages with more workers may reorder.
pub struct Pipeline<In, Out> {
    shared: Arc<PipelineShared>,
    head: Mutex<Option<mpsc::Sender<In>>>,
    output: Mutex<Option<OutputStream<Out>>>,
    errors: Mutex<Option<ErrorStream>>,
    draining: AtomicBool,
    runtime: Handle,
}

/// State the drain task needs after the handle's methods have returned.
struct PipelineShared {
    name: String,
    stages: Vec<StageHandle>,
    dropped_errors: Arc<AtomicU64>,
    token: CancellationToken,
    lifecycle: Lifecycle<PipelineReport>,
}

impl PipelineShared {
    fn stage_reports(&self) -> Vec<StageReport> {
        self.stages
            .iter()
            .map(|s| StageReport::from_counters(&s.name, &s.counters))
            .collect()
    }

    /// Shut the stage pools down in order, then publish the report.
    #[instrument(skip_all, fields(pipeline = %self.name))]
    async fn drain(self: Arc<Self>) {
        for stage in &self.stages {
            let mode = if self.token.is_cancelled() {
                ShutdownMode::Abort
            } else {
                ShutdownMode::Graceful
            };
            stage.pool.shutdown(mode).await;
            debug!(stage = %stage.name, "Stage drained");
        }

        let report = PipelineReport {
            stages: self.stage_reports(),
            dropped_errors: self.dropped_errors.load(Ordering::Relaxed),
            cancelled: self.token.is_cancelled(),
        };
        self.lifecycle.begin_shutdown();
        info!(cancelled = report.cancelled, "Pipeline finished");
        self.lifecycle.finish(report);
    }
}

impl Pipeline<(), ()> {
    /// Start building a pipeline whose first stage is `first`.
    pub fn builder<In, Out>(first: StageSpec<In, Out>) -> PipelineBuilder<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        PipelineBuilder::new(first)
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Feed an item into the first stage, waiting while its buffer is full.
    ///
    /// Fails with [`Error::PipelineCancelled`] if `cancel` or the pipeline is
    /// cancelled before the item is accepted, and with
    /// [`Error::PipelineClosed`] after [`close`](Self::close).
    pub async fn push(&self, item: In, cancel: &CancellationToken) -> Result<()> {
        let token = &self.shared.token;
        if token.is_cancelled() {
            return Err(Error::PipelineCancelled);
        }
        let head = lock(&self.head).clone().ok_or(Error::PipelineClosed)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::PipelineCancelled),
            _ = token.cancelled() => Err(Error::PipelineCancelled),
            sent = head.send(item) => sent.map_err(|_| Error::PipelineClosed),
        }
    }

    /// Signal end of input. Stages drain in order and the output stream ends
    /// after the last item.
    pub fn close(&self) {
        if lock(&self.head).take().is_some() {
            info!(pipeline = %self.shared.name, "Pipeline input closed");
        }
        self.shared.lifecycle.begin_shutdown();
        self.start_drain();
    }

    /// Cancel every stage. In-flight transforms are cancelled and buffered
    /// items are discarded.
    pub fn cancel(&self) {
        lock(&self.head).take();
        if !self.shared.token.is_cancelled() {
            warn!(pipeline = %self.shared.name, "Pipeline cancelled");
            self.shared.token.cancel();
        }
        self.shared.lifecycle.begin_shutdown();
        self.start_drain();
    }

    /// Wait until every stage has drained and exited, in stage order.
    ///
    /// Does not close the input itself; call [`close`](Self::close) or
    /// [`cancel`](Self::cancel) first or concurrently. Later and concurrent
    /// calls get the same report, including after an earlier call was dropped.
    pub async fn join(&self) -> PipelineReport {
        self.start_drain();
        self.shared.lifecycle.stopped().await
    }

    /// Spawn the drain task once. It outlives any caller's future.
    fn start_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            self.runtime.spawn(Arc::clone(&self.shared).drain());
        }
    }

    /// Take the output stream. `None` if already taken.
    pub fn take_output(&self) -> Option<OutputStream<Out>> {
        lock(&self.output).take()
    }

    /// Take the error stream. `None` if already taken.
    pub fn take_errors(&self) -> Option<ErrorStream> {
        lock(&self.errors).take()
    }

    /// Errors dropped because the sink was full or not being read.
    pub fn dropped_errors(&self) -> u64 {
        self.shared.dropped_errors.load(Ordering::Relaxed)
    }

    pub fn stage_reports(&self) -> Vec<StageReport> {
        self.shared.stage_reports()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `Running` until closed or cancelled, `Stopped` once drained.
    pub fn state(&self) -> PoolState {
        self.shared.lifecycle.state()
    }
}

impl<In, Out> fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.shared.name)
            .field(
                "stages",
                &self.shared.stages.iter().map(|s| &s.name).collect::<Vec<_>>(),
            )
            .field("state", &self.shared.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl<In, Out> Drop for Pipeline<In, Out> {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

#[async_trait]
impl<In, Out> Shutdown for Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn shutdown(&self, mode: ShutdownMode) {
        match mode {
            ShutdownMode::Graceful => self.close(),
            ShutdownMode::Abort => self.cancel(),
        }
        self.join().await;
    }
}
