//! Metrics hooks.
//!
//! The engine reports queue depth, worker activity, task latency, errors and
//! scheduler firings through [`Observer`]. Every hook has a no-op default so
//! an exporter only implements what it needs; [`MetricsCollector`] keeps an
//! in-memory snapshot for dashboards and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, TaskError};
use crate::id::JobId;
use crate::task::TaskResult;

/// Receives engine events. Implementations must be cheap and non-blocking;
/// hooks run on worker and scheduler tasks.
pub trait Observer: Send + Sync {
    fn on_queue_depth(&self, _pool: &str, _depth: usize) {}

    fn on_active_workers(&self, _pool: &str, _active: usize) {}

    fn on_task_finished(&self, _pool: &str, _result: &TaskResult) {}

    fn on_submit_rejected(&self, _pool: &str, _error: &Error) {}

    fn on_job_fired(&self, _job: JobId, _name: &str) {}

    fn on_job_skipped(&self, _job: JobId, _name: &str) {}
}

/// Blanket implementation so `Arc<dyn Observer>` can be used directly.
impl<T: Observer + ?Sized> Observer for Arc<T> {
    fn on_queue_depth(&self, pool: &str, depth: usize) {
        (**self).on_queue_depth(pool, depth)
    }

    fn on_active_workers(&self, pool: &str, active: usize) {
        (**self).on_active_workers(pool, active)
    }

    fn on_task_finished(&self, pool: &str, result: &TaskResult) {
        (**self).on_task_finished(pool, result)
    }

    fn on_submit_rejected(&self, pool: &str, error: &Error) {
        (**self).on_submit_rejected(pool, error)
    }

    fn on_job_fired(&self, job: JobId, name: &str) {
        (**self).on_job_fired(job, name)
    }

    fn on_job_skipped(&self, job: JobId, name: &str) {
        (**self).on_job_skipped(job, name)
    }
}

/// Observer that ignores everything. The default for every component.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Per-pool counters and gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub queue_depth: usize,
    pub peak_queue_depth: usize,
    pub active_workers: usize,
    pub peak_active_workers: usize,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_panicked: u64,
    pub tasks_cancelled: u64,
    pub submits_rejected: u64,
    /// Mean task duration over all finished tasks.
    pub avg_latency: Duration,
    pub max_latency: Duration,
}

impl PoolMetrics {
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_succeeded
            + self.tasks_failed
            + self.tasks_timed_out
            + self.tasks_panicked
            + self.tasks_cancelled
    }

    fn record_latency(&mut self, duration: Duration) {
        let count = self.tasks_finished();
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_latency = if count <= 1 {
            duration
        } else {
            let prev = self.avg_latency.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
        self.max_latency = self.max_latency.max(duration);
    }
}

/// Per-job scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobMetrics {
    pub name: String,
    pub fired: u64,
    pub skipped: u64,
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of everything a [`MetricsCollector`] has seen.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub pools: HashMap<String, PoolMetrics>,
    /// Keyed by job id (`job-<n>`).
    pub jobs: HashMap<String, JobMetrics>,
}

/// In-memory [`Observer`] that aggregates counters for later inspection.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_pool(&self, pool: &str, f: impl FnOnce(&mut PoolMetrics)) {
        let mut inner = self.lock();
        f(inner.pools.entry(pool.to_string()).or_default());
    }

    fn with_job(&self, job: JobId, name: &str, f: impl FnOnce(&mut JobMetrics)) {
        let mut inner = self.lock();
        let entry = inner.jobs.entry(job.to_string()).or_insert_with(|| JobMetrics {
            name: name.to_string(),
            ..JobMetrics::default()
        });
        f(entry);
    }
}

impl Observer for MetricsCollector {
    fn on_queue_depth(&self, pool: &str, depth: usize) {
        self.with_pool(pool, |m| {
            m.queue_depth = depth;
            m.peak_queue_depth = m.peak_queue_depth.max(depth);
        });
    }

    fn on_active_workers(&self, pool: &str, active: usize) {
        self.with_pool(pool, |m| {
            m.active_workers = active;
            m.peak_active_workers = m.peak_active_workers.max(active);
        });
    }

    fn on_task_finished(&self, pool: &str, result: &TaskResult) {
        self.with_pool(pool, |m| {
            match &result.outcome {
                Ok(()) => m.tasks_succeeded += 1,
                Err(TaskError::Failed(_)) => m.tasks_failed += 1,
                Err(TaskError::Timeout(_)) => m.tasks_timed_out += 1,
                Err(TaskError::Panic(_)) => m.tasks_panicked += 1,
                Err(TaskError::Cancelled) => m.tasks_cancelled += 1,
            }
            m.record_latency(result.duration);
        });
    }

    fn on_submit_rejected(&self, pool: &str, _error: &Error) {
        self.with_pool(pool, |m| m.submits_rejected += 1);
    }

    fn on_job_fired(&self, job: JobId, name: &str) {
        self.with_job(job, name, |m| {
            m.fired += 1;
            m.last_fired_at = Some(Utc::now());
        });
    }

    fn on_job_skipped(&self, job: JobId, name: &str) {
        self.with_job(job, name, |m| m.skipped += 1);
    }
}
