// Document pipeline: stage composition, the stages themselves, and persistent state

pub mod orchestrator;
pub mod processing;
pub mod steps;
pub mod storage;

pub use orchestrator::{compose, preview, PipelineDeps, PipelineRunner, RunOptions, RunSummary};
pub use steps::{PipelineStage, StageKind};
