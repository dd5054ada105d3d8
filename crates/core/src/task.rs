use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::TaskError;
use crate::id::TaskId;

/// Boxed future produced by a task body.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

type TaskFn = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send + 'static>;

/// A unit of cancellable work.
///
/// The body receives a [`TaskContext`] and is expected to observe its
/// cancellation token. Cancellation is cooperative, but the executor also
/// drops the body's future once the context is cancelled, so a task that
/// ignores its token still loses any further influence.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    work: TaskFn,
}

impl Task {
    /// Create a task from an async closure.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: TaskId::next(),
            name: None,
            work: Box::new(move |ctx: TaskContext| -> TaskFuture { Box::pin(work(ctx)) }),
        }
    }

    /// Attach a human-readable name (used in logs and results).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Consume the task and produce its future.
    pub fn start(self, ctx: TaskContext) -> TaskFuture {
        (self.work)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Execution context handed to a running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            task_id,
            token,
            deadline,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The task's own cancellation token (child of its pool's token).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled (timeout, shutdown or pipeline cancel).
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Outcome of one executed task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub name: Option<String>,
    pub outcome: Result<(), TaskError>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_runs_body_with_context() {
        let task = Task::new(|ctx| async move {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            Ok(())
        })
        .with_name("probe");

        assert_eq!(task.name(), Some("probe"));
        let ctx = TaskContext::new(task.id(), CancellationToken::new(), None);
        assert!(task.start(ctx).await.is_ok());
    }

    #[test]
    fn remaining_is_none_without_deadline() {
        let ctx = TaskContext::new(TaskId::next(), CancellationToken::new(), None);
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn remaining_counts_down_to_deadline() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let ctx = TaskContext::new(TaskId::next(), CancellationToken::new(), Some(deadline));
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(50));
    }
}
