//! Bounded async worker pool.
//!
//! Split into focused submodules:
//! - `core`: pool struct, builder, submission and accessors
//! - `worker`: the per-worker loop and guarded task execution
//! - `shutdown`: graceful drain, abort and drop handling

mod core;
mod shutdown;
mod worker;

pub use self::core::{ResultCallback, ResultStream, WorkerPool, WorkerPoolBuilder};
