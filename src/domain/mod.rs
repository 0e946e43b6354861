//! Data shapes shared by the stages: records and the context threaded between them.

pub mod context;
pub mod record;

pub use context::{merge_output, ContextValue, PipelineContext, SourceDocument, StageOutput};
pub use record::{value_to_string, DownloadStatus, Record, RESERVED_FIELDS};
