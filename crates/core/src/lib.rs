pub mod admission;
pub mod config;
pub mod error;
pub mod execute;
pub mod id;
pub mod lifecycle;
pub mod observer;
pub mod shutdown;
pub mod task;

pub use admission::Admission;
pub use config::{PipelineSettings, PoolConfig, StageSettings};
pub use error::{Error, Result, TaskError};
pub use execute::{panic_message, run_guarded};
pub use id::{JobId, TaskId};
pub use lifecycle::{Lifecycle, PoolState, ShutdownMode, ShutdownReport};
pub use observer::{JobMetrics, MetricsCollector, MetricsSnapshot, NoopObserver, Observer, PoolMetrics};
pub use shutdown::{wait_for_signal, Shutdown, ShutdownCoordinator};
pub use task::{Task, TaskContext, TaskFuture, TaskResult};

pub use tokio_util::sync::CancellationToken;
