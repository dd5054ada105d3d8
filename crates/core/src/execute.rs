//! Guarded execution shared by pool workers and pipeline stages.
//!
//! Wraps a task future with panic isolation, an optional deadline and a
//! cancellation token. Whatever the body does, the caller gets back a plain
//! `Result` and the worker that awaited it stays alive.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Run `fut` to completion under `token` and an optional `timeout`.
///
/// - a panic inside `fut` becomes [`TaskError::Panic`]
/// - exceeding `timeout` cancels `token` and yields [`TaskError::Timeout`]
/// - `token` firing first yields [`TaskError::Cancelled`]
///
/// In every error case the future is dropped before this returns.
pub async fn run_guarded<F, T>(
    fut: F,
    token: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, TaskError>>,
{
    let guarded = async {
        let caught = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, caught).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    token.cancel();
                    return Err(TaskError::Timeout(limit));
                }
            },
            None => caught.await,
        };
        outcome.unwrap_or_else(|payload| Err(TaskError::Panic(panic_message(payload.as_ref()))))
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Cancelled),
        outcome = guarded => outcome,
    }
}

/// Best-effort extraction of a panic payload's message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
