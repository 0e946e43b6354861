use async_trait::async_trait;

use crate::domain::{PipelineContext, StageOutput};
use crate::error::Result;

/// Common trait for all pipeline stages
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Consume the running context and hand back the stage's result
    async fn run(&self, ctx: PipelineContext) -> Result<StageOutput>;

    /// Key under which non-mapping results are stored
    fn name(&self) -> &'static str;
}

/// The closed set of stages a template can compose. Resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Fetch,
    ExtractMarkup,
    ExtractJson,
    Download,
    HtmlEnrich,
    JsonEnrich,
    Process,
    Normalize,
    Summarize,
    Persist,
    Alert,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::ExtractMarkup => "extract",
            StageKind::ExtractJson => "json_extract",
            StageKind::Download => "download",
            StageKind::HtmlEnrich => "html_enrich",
            StageKind::JsonEnrich => "json_enrich",
            StageKind::Process => "processing",
            StageKind::Normalize => "normalize",
            StageKind::Summarize => "summarize",
            StageKind::Persist => "persist",
            StageKind::Alert => "alert",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub mod alert;
pub mod download;
pub mod extract_json;
pub mod extract_markup;
pub mod field_rules;
pub mod fetch;
pub mod html_enrich;
pub mod json_enrich;
pub mod normalize;
pub mod persist;
pub mod processing;
pub mod summarize;

#[cfg(test)]
pub(crate) mod test_support;

pub use alert::{AlertStage, TemplateAlertRenderer};
pub use download::DownloadStage;
pub use extract_json::JsonExtractStage;
pub use extract_markup::MarkupExtractStage;
pub use fetch::FetchStage;
pub use html_enrich::HtmlEnrichStage;
pub use json_enrich::JsonEnrichStage;
pub use normalize::NormalizeStage;
pub use persist::PersistStage;
pub use processing::ProcessingStage;
pub use summarize::SummarizeStage;
