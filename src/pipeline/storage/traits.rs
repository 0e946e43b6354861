use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Record;
use crate::idempotency::record_fingerprint;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable form of an accepted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub fingerprint: String,
    pub url: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub excerpt: Option<String>,
    pub gpt_text: Option<String>,
    /// Summary fields serialized as a JSON object.
    pub summary: Option<String>,
    pub error: Option<String>,
    pub status: String,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
}

const MAX_TITLE_CHARS: usize = 500;

impl StoredEvent {
    pub fn from_record(record: &Record, template_name: &str) -> StoreResult<Self> {
        let summary = match &record.summary {
            Some(fields) => Some(serde_json::to_string(fields)?),
            None => None,
        };
        Ok(Self {
            fingerprint: record_fingerprint(record),
            url: record.identity_url().to_string(),
            title: record
                .title
                .as_ref()
                .map(|t| t.chars().take(MAX_TITLE_CHARS).collect()),
            text: record.text.clone(),
            excerpt: record.excerpt.clone(),
            gpt_text: record.gpt_text.clone(),
            summary,
            error: record.error.clone().or_else(|| record.summary_error.clone()),
            status: record.status().to_string(),
            template_name: template_name.to_string(),
            created_at: Utc::now(),
        })
    }
}

/// Persistent "have we seen this" store keyed by fingerprint and by URL.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists_by_url(&self, url: &str) -> StoreResult<bool>;

    async fn exists_by_fingerprint(&self, record: &Record) -> StoreResult<bool>;

    /// Insert the record as a new event. Returns false when its URL or fingerprint is
    /// already known. Check and insert happen atomically.
    async fn save(&self, record: &Record, template_name: &str) -> StoreResult<bool>;

    async fn count(&self) -> StoreResult<usize>;

    fn fingerprint(&self, record: &Record) -> String {
        record_fingerprint(record)
    }
}

/// Memo of resolved transforms keyed by (template, transform, input).
#[async_trait]
pub trait TransformCache: Send + Sync {
    async fn get(&self, template: &str, transform: &str, input: &str) -> StoreResult<Option<String>>;

    /// Upsert; a repeated key overwrites output and timestamp.
    async fn put(&self, template: &str, transform: &str, input: &str, output: &str) -> StoreResult<()>;
}
