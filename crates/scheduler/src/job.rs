use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kairos_core::{Error, JobId, TaskContext, TaskError, TaskFuture, TaskId};
use kairos_pool::WorkerPool;
use serde::Serialize;

use crate::trigger::Trigger;

/// Body of a scheduled job, invoked once per firing.
pub type JobWork = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// What happens when a job fires while its previous firing is unfinished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum OverlapPolicy {
    /// Drop the firing if a task for this job is queued or running.
    #[default]
    Skip,
    /// Submit anyway; the target pool's queue bound is the backpressure.
    Queue,
}

/// Everything needed to register a job with a [`Scheduler`](crate::Scheduler).
pub struct JobSpec {
    pub(crate) name: Option<String>,
    pub(crate) trigger: Trigger,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) overlap: OverlapPolicy,
    pub(crate) work: JobWork,
}

impl JobSpec {
    pub fn new<F, Fut>(trigger: Trigger, pool: Arc<WorkerPool>, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name: None,
            trigger,
            pool,
            overlap: OverlapPolicy::default(),
            work: Arc::new(move |ctx: TaskContext| -> TaskFuture { Box::pin(work(ctx)) }),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn overlap(mut self, policy: OverlapPolicy) -> Self {
        self.overlap = policy;
        self
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("pool", &self.pool.name())
            .field("overlap", &self.overlap)
            .finish_non_exhaustive()
    }
}

/// A registered job. Only the scheduler mutates `next_fire`.
pub(crate) struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub trigger: Trigger,
    pub pool: Arc<WorkerPool>,
    pub overlap: OverlapPolicy,
    pub work: JobWork,
    pub next_fire: Option<DateTime<Utc>>,
    pub in_flight: Arc<AtomicUsize>,
    pub fired: u64,
    pub skipped: u64,
    pub rejected: u64,
}

impl ScheduledJob {
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            trigger: self.trigger.describe(),
            pool: self.pool.name().to_string(),
            overlap: self.overlap,
            next_fire: self.next_fire,
            fired: self.fired,
            skipped: self.skipped,
            rejected: self.rejected,
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}

/// Counts a job's queued and running tasks; held by the task until it is
/// finished or dropped unrun.
pub(crate) struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read-only view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub trigger: String,
    pub pool: String,
    pub overlap: OverlapPolicy,
    /// `None` once the trigger has no further instants.
    pub next_fire: Option<DateTime<Utc>>,
    pub fired: u64,
    pub skipped: u64,
    pub rejected: u64,
    /// Tasks for this job currently queued or running.
    pub in_flight: usize,
}

/// Result of one job firing.
#[derive(Debug)]
pub struct Firing {
    pub job_id: JobId,
    /// The fire time that was due, not the time it was processed.
    pub scheduled_for: DateTime<Utc>,
    pub outcome: FireOutcome,
}

#[derive(Debug)]
pub enum FireOutcome {
    Submitted(TaskId),
    /// Overlap policy `Skip` and the previous firing was unfinished.
    Skipped,
    /// The target pool refused the task.
    Rejected(Error),
}

impl FireOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }
}
