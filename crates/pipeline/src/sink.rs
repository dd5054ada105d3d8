use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kairos_core::TaskError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// An item that failed in a stage. The item itself does not continue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("stage {stage} ({stage_name}): {error}")]
pub struct StageError {
    /// Zero-based stage index.
    pub stage: usize,
    pub stage_name: String,
    #[serde(serialize_with = "serialize_task_error")]
    pub error: TaskError,
}

fn serialize_task_error<S: serde::Serializer>(err: &TaskError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(err)
}

/// Bounded error channel shared by every stage worker.
///
/// Never blocks a worker: when the sink is full or nobody listens, the
/// error is counted in `dropped` and logged.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<StageError>,
    dropped: Arc<AtomicU64>,
}

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<StageError>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    pub fn report(&self, err: StageError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stage = %err.stage_name, "Error sink full, dropping: {}", err.error);
            }
            Err(TrySendError::Closed(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stage = %err.stage_name, "Error sink closed, dropping: {}", err.error);
            }
        }
    }
}
