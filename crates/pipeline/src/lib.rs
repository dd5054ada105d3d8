pub mod pipeline;
pub mod sink;
pub mod stage;

pub use pipeline::{ErrorStream, OutputStream, Pipeline, PipelineBuilder, PipelineReport};
pub use sink::StageError;
pub use stage::{StageReport, StageSpec, Transform};
