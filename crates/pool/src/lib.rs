pub mod pool;
mod queue;
pub mod stats;

pub use pool::{ResultCallback, ResultStream, WorkerPool, WorkerPoolBuilder};
pub use stats::PoolStats;
