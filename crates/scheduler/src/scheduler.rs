//! Single-loop job scheduler.
//!
//! One coordination loop waits on the clock for the earliest fire time, a
//! job-table change, or stop, then fires every due job in
//! (`next_fire`, `JobId`) order by submitting a task to the job's pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_core::{
    Error, JobId, Lifecycle, NoopObserver, Observer, PoolState, Result, Shutdown, ShutdownMode,
    Task,
};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::job::{FireOutcome, Firing, InFlight, JobInfo, JobSpec, OverlapPolicy, ScheduledJob};

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    jobs: Mutex<BTreeMap<JobId, ScheduledJob>>,
    next_id: AtomicU64,
    changed: Notify,
    token: CancellationToken,
    lifecycle: Lifecycle<()>,
}

/// Fires jobs on intervals or cron calendars into worker pools.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    started: AtomicBool,
    handle: Mutex<Option<(Handle, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(clock: impl Clock) -> Self {
        Self::with_observer(clock, Arc::new(NoopObserver))
    }

    pub fn with_observer(clock: impl Clock, observer: Arc<dyn Observer>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                clock: Arc::new(clock),
                observer,
                jobs: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                changed: Notify::new(),
                token: CancellationToken::new(),
                lifecycle: Lifecycle::new(),
            }),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Register a job. Its first fire time is the first trigger instant after
    /// the clock's current time.
    pub fn add_job(&self, spec: JobSpec) -> Result<JobId> {
        if !self.inner.lifecycle.is_running() {
            return Err(Error::ShuttingDown);
        }
        spec.trigger.validate()?;

        let id = JobId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let next_fire = spec.trigger.next_after(self.inner.clock.now());
        let job = ScheduledJob {
            id,
            name: spec.name.unwrap_or_else(|| id.to_string()),
            trigger: spec.trigger,
            pool: spec.pool,
            overlap: spec.overlap,
            work: spec.work,
            next_fire,
            in_flight: Arc::default(),
            fired: 0,
            skipped: 0,
            rejected: 0,
        };
        info!(
            job = %id,
            name = %job.name,
            trigger = %job.trigger.describe(),
            next_fire = ?next_fire,
            "Job added"
        );

        self.inner.lock_jobs().insert(id, job);
        self.inner.changed.notify_one();
        Ok(id)
    }

    /// Remove a job. Unknown ids are ignored; returns whether a job was removed.
    /// Tasks already submitted for the job keep running.
    pub fn remove_job(&self, id: JobId) -> bool {
        let removed = self.inner.lock_jobs().remove(&id);
        match removed {
            Some(job) => {
                info!(job = %id, name = %job.name, "Job removed");
                self.inner.changed.notify_one();
                true
            }
            None => {
                debug!(job = %id, "Unknown job, nothing to remove");
                false
            }
        }
    }

    pub fn job(&self, id: JobId) -> Result<JobInfo> {
        self.inner
            .lock_jobs()
            .get(&id)
            .map(ScheduledJob::info)
            .ok_or(Error::JobNotFound(id))
    }

    /// All jobs in ascending id order.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner.lock_jobs().values().map(ScheduledJob::info).collect()
    }

    /// Fire every job whose fire time has passed, in (`next_fire`, `JobId`)
    /// order. This is one step of the coordination loop; tests can call it
    /// directly instead of [`start`](Self::start).
    pub fn fire_due(&self) -> Vec<Firing> {
        self.inner.fire_due()
    }

    /// Spawn the coordination loop on the current runtime.
    pub fn start(&self) -> Result<()> {
        if !self.inner.lifecycle.is_running() {
            return Err(Error::ShuttingDown);
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let handle = runtime.spawn(Arc::clone(&self.inner).run());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some((runtime, handle));
        Ok(())
    }

    /// Halt the loop and wait for it to exit. Submitted tasks are not
    /// retracted. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.lifecycle.begin_shutdown() {
            inner.token.cancel();
            let handle = self
                .handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match handle {
                // Detached: dropping this future must not leave the scheduler in `Draining`.
                Some((runtime, handle)) => {
                    runtime.spawn(finish_stop(Arc::clone(inner), handle));
                }
                None => {
                    inner.lifecycle.finish(());
                    info!("Scheduler stopped");
                }
            }
        }
        inner.lifecycle.stopped().await;
    }

    pub fn state(&self) -> PoolState {
        self.inner.lifecycle.state()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("started", &self.is_started())
            .field("jobs", &self.inner.lock_jobs().len())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}

#[async_trait]
impl Shutdown for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn shutdown(&self, _mode: ShutdownMode) {
        self.stop().await;
    }
}

impl SchedulerInner {
    fn lock_jobs(&self) -> MutexGuard<'_, BTreeMap<JobId, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.lock_jobs().values().filter_map(|job| job.next_fire).min()
    }

    async fn run(self: Arc<Self>) {
        info!("Scheduler loop started");

        loop {
            let changed = self.changed.notified();
            let next = self.earliest();

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = changed => continue,
                _ = sleep_until(&*self.clock, next) => {}
            }

            let firings = self.fire_due();
            if !firings.is_empty() {
                debug!(count = firings.len(), "Fired due jobs");
            }
        }

        info!("Scheduler loop exiting");
    }

    fn fire_due(&self) -> Vec<Firing> {
        if !self.lifecycle.is_running() {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut jobs = self.lock_jobs();

        let mut due: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter_map(|job| job.next_fire.filter(|at| *at <= now).map(|at| (at, job.id)))
            .collect();
        due.sort_unstable();

        let mut firings = Vec::with_capacity(due.len());
        for (scheduled_for, id) in due {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            job.next_fire = job.trigger.next_after(now);
            if job.next_fire.is_none() {
                info!(job = %id, name = %job.name, "Trigger exhausted, job is now dormant");
            }
            let outcome = self.fire(job);
            firings.push(Firing {
                job_id: id,
                scheduled_for,
                outcome,
            });
        }
        firings
    }

    fn fire(&self, job: &mut ScheduledJob) -> FireOutcome {
        if job.overlap == OverlapPolicy::Skip && job.in_flight.load(Ordering::Acquire) > 0 {
            job.skipped += 1;
            self.observer.on_job_skipped(job.id, &job.name);
            debug!(job = %job.id, name = %job.name, "Previous firing unfinished, skipping");
            return FireOutcome::Skipped;
        }

        let guard = InFlight::acquire(&job.in_flight);
        let work = Arc::clone(&job.work);
        let task = Task::new(move |ctx| async move {
            let _in_flight = guard;
            work(ctx).await
        })
        .with_name(job.name.clone());

        match job.pool.submit(task) {
            Ok(task_id) => {
                job.fired += 1;
                self.observer.on_job_fired(job.id, &job.name);
                debug!(job = %job.id, task = %task_id, "Job fired");
                FireOutcome::Submitted(task_id)
            }
            Err(e) => {
                job.rejected += 1;
                warn!(job = %job.id, name = %job.name, pool = %job.pool.name(), "Scheduled submit rejected: {}", e);
                FireOutcome::Rejected(e)
            }
        }
    }
}

async fn finish_stop(inner: Arc<SchedulerInner>, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("Scheduler loop failed: {}", e);
    }
    inner.lifecycle.finish(());
    info!("Scheduler stopped");
}

async fn sleep_until(clock: &dyn Clock, next: Option<DateTime<Utc>>) {
    match next {
        Some(at) => clock.sleep_until(at).await,
        None => std::future::pending().await,
    }
}
