use thiserror::Error;

use crate::pipeline::processing::template::TemplateError;
use crate::pipeline::storage::StoreError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported template format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Stage {stage} failed: {message}")]
    Stage { stage: &'static str, message: String },
}

impl PipelineError {
    /// Configuration problems are reported differently from run failures by the CLI.
    pub fn is_config(&self) -> bool {
        matches!(self, PipelineError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
