use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Defaults ──────────────────────────────────────────────────

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_size() -> usize {
    64
}

fn default_stage_workers() -> usize {
    1
}

fn default_stage_buffer() -> usize {
    16
}

fn default_output_buffer() -> usize {
    16
}

fn default_error_buffer() -> usize {
    1024
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ── Worker pool ───────────────────────────────────────────────

/// Worker pool sizing and limits.
///
/// Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers. Defaults to the available parallelism.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Pending tasks accepted beyond those handed straight to idle workers.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Per-task deadline in milliseconds (0 = no timeout).
    #[serde(default)]
    pub task_timeout_ms: u64,
    /// Capacity of the result stream (0 = no result stream).
    #[serde(default)]
    pub result_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
            task_timeout_ms: 0,
            result_buffer: 0,
        }
    }
}

impl PoolConfig {
    pub fn new(worker_count: usize, queue_size: usize) -> Self {
        Self {
            worker_count,
            queue_size,
            ..Self::default()
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_result_buffer(mut self, capacity: usize) -> Self {
        self.result_buffer = capacity;
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        millis(self.task_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::invalid_config("worker_count must be at least 1"));
        }
        Ok(())
    }
}

// ── Pipeline ──────────────────────────────────────────────────

/// Settings for a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    pub name: String,
    #[serde(default = "default_stage_workers")]
    pub worker_count: usize,
    /// Capacity of the channel feeding this stage.
    #[serde(default = "default_stage_buffer")]
    pub buffer: usize,
    /// Per-item deadline in milliseconds (0 = no timeout).
    #[serde(default)]
    pub item_timeout_ms: u64,
}

impl StageSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_count: default_stage_workers(),
            buffer: default_stage_buffer(),
            item_timeout_ms: 0,
        }
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        millis(self.item_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::invalid_config(format!(
                "stage '{}': worker_count must be at least 1",
                self.name
            )));
        }
        if self.buffer == 0 {
            return Err(Error::invalid_config(format!(
                "stage '{}': buffer must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Pipeline-wide channel sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Capacity of the final output channel.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Capacity of the error sink. Errors beyond it are counted and dropped.
    #[serde(default = "default_error_buffer")]
    pub error_buffer: usize,
    /// Optional per-stage overrides, matched by stage name.
    #[serde(default)]
    pub stages: Vec<StageSettings>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_buffer: default_output_buffer(),
            error_buffer: default_error_buffer(),
            stages: Vec::new(),
        }
    }
}

impl PipelineSettings {
    /// Look up the override for a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageSettings> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_buffer == 0 {
            return Err(Error::invalid_config("output_buffer must be at least 1"));
        }
        if self.error_buffer == 0 {
            return Err(Error::invalid_config("error_buffer must be at least 1"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            stage.validate()?;
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(Error::invalid_config(format!(
                    "duplicate stage settings for '{}'",
                    stage.name
                )));
            }
        }
        Ok(())
    }
}
