//! Bounded FIFO shared by a pool's workers.
//!
//! Capacity counts only tasks waiting beyond those an idle worker is ready
//! to take, so a pool with `queue_size = 0` still hands work straight to
//! idle workers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kairos_core::Task;
use tokio::sync::Notify;

/// Why a push was refused. The task is handed back to the caller.
pub(crate) enum Rejected {
    Full(Task),
    Closed(Task),
}

struct QueueInner {
    pending: VecDeque<Task>,
    idle_workers: usize,
    closed: bool,
}

pub(crate) struct TaskQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    work_ready: Notify,
    space_ready: Notify,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::with_capacity(capacity),
                idle_workers: 0,
                closed: false,
            }),
            work_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks waiting for a busy worker. Tasks already claimed by an idle
    /// worker are in hand-off and not counted.
    pub(crate) fn len(&self) -> usize {
        let inner = self.lock();
        inner.pending.len().saturating_sub(inner.idle_workers)
    }

    /// Enqueue without waiting. Returns the new depth.
    pub(crate) fn try_push(&self, task: Task) -> Result<usize, Rejected> {
        let depth = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Rejected::Closed(task));
            }
            if inner.pending.len() >= self.capacity + inner.idle_workers {
                return Err(Rejected::Full(task));
            }
            inner.pending.push_back(task);
            inner.pending.len()
        };
        self.work_ready.notify_one();
        Ok(depth)
    }

    /// Enqueue, waiting for room. Gives the task back if the queue closes
    /// first. The future is cancel-safe only in the sense that a dropped
    /// push never enqueues.
    pub(crate) async fn push(&self, mut task: Task) -> Result<usize, Rejected> {
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_push(task) {
                Ok(depth) => return Ok(depth),
                Err(Rejected::Full(t)) => task = t,
                Err(closed) => return Err(closed),
            }
            space.await;
        }
    }

    /// Take the next task, waiting while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<Task> {
        loop {
            let work = self.work_ready.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(task) = inner.pending.pop_front() {
                    drop(inner);
                    self.space_ready.notify_waiters();
                    return Some(task);
                }
                if inner.closed {
                    return None;
                }
                inner.idle_workers += 1;
            }
            // an idle worker is room for one more task
            self.space_ready.notify_waiters();

            let _idle = IdleGuard(self);
            work.await;
        }
    }

    /// Refuse new tasks; queued ones are still handed out.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.work_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Refuse new tasks and remove everything still queued.
    pub(crate) fn close_and_drain(&self) -> Vec<Task> {
        let drained: Vec<Task> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain(..).collect()
        };
        self.work_ready.notify_waiters();
        self.space_ready.notify_waiters();
        drained
    }
}

struct IdleGuard<'a>(&'a TaskQueue);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.lock();
        inner.idle_workers = inner.idle_workers.saturating_sub(1);
    }
}
