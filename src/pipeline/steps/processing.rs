use async_trait::async_trait;
use chrono::Local;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PipelineStage;
use crate::app::ports::PdfTextExtractor;
use crate::config::{ExcerptLimits, ProcessingConfig};
use crate::constants::KEY_PROCESSING_STATS;
use crate::domain::{PipelineContext, Record, StageOutput};
use crate::error::{ConfigError, Result};
use crate::metrics::StateMetrics;
use crate::pipeline::processing::excerpt::{head_tail, ExcerptRules};
use crate::pipeline::storage::DedupStore;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// What happened to one record carrying downloaded bytes.
enum Outcome {
    PassThrough,
    Extracted,
    Duplicate,
    Failed(String),
}

/// Turns downloaded PDFs into text and bounded excerpts. `file_content` never leaves here.
pub struct ProcessingStage {
    policy: ProcessingConfig,
    rules: ExcerptRules,
    limits: ExcerptLimits,
    pdf: Arc<dyn PdfTextExtractor>,
    dedup: Arc<dyn DedupStore>,
}

pub fn is_pdf(url: &str, bytes: &[u8]) -> bool {
    url.to_lowercase().contains(".pdf") || bytes.starts_with(PDF_MAGIC)
}

impl ProcessingStage {
    pub fn new(
        policy: ProcessingConfig,
        pdf: Arc<dyn PdfTextExtractor>,
        dedup: Arc<dyn DedupStore>,
    ) -> std::result::Result<Self, ConfigError> {
        let rules = ExcerptRules::new(&policy.extract_keywords, &policy.extract_patterns).map_err(|e| {
            ConfigError::Invalid {
                field: "processing.extract_patterns".to_string(),
                message: e.to_string(),
            }
        })?;
        let limits = policy.limits();
        Ok(Self {
            policy,
            rules,
            limits,
            pdf,
            dedup,
        })
    }

    async fn extract_text(&self, bytes: Vec<u8>) -> std::result::Result<String, String> {
        let pdf = Arc::clone(&self.pdf);
        let max_pages = self.policy.max_pages;
        tokio::task::spawn_blocking(move || pdf.extract(&bytes, max_pages))
            .await
            .map_err(|e| format!("PDF worker failed: {e}"))?
            .map_err(|e| format!("Failed to process PDF: {e:#}"))
    }

    async fn process_record(&self, record: &mut Record) -> Outcome {
        let Some(bytes) = record.file_content.take() else {
            return Outcome::PassThrough;
        };
        let url = record.final_url.clone().unwrap_or_else(|| record.identity_url().to_string());
        if !is_pdf(&url, &bytes) {
            debug!(url = %url, "downloaded content is not a PDF, passing through");
            return Outcome::PassThrough;
        }

        let text = match self.extract_text(bytes).await {
            Ok(text) => text,
            Err(message) => {
                warn!(url = %url, "{}", message);
                record.text = Some(format!("[ERROR: {message}]"));
                record.error = Some(message.clone());
                return Outcome::Failed(message);
            }
        };
        info!("Extracted {} chars from {}", text.chars().count(), url);
        record.text = Some(text);

        match self.dedup.exists_by_fingerprint(record).await {
            Ok(true) => {
                StateMetrics::record_known(1);
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => warn!(url = %url, "fingerprint lookup failed: {}", e),
        }

        let text = record.text.as_deref().unwrap_or_default();
        if self.rules.is_empty() {
            record.gpt_text = Some(head_tail(text, &self.limits));
        } else {
            let excerpt = self.rules.excerpt(text, &self.limits);
            record.gpt_text = Some(excerpt.clone());
            record.excerpt = Some(excerpt);
        }
        Outcome::Extracted
    }
}

#[async_trait]
impl PipelineStage for ProcessingStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let mut processed = 0usize;
        let mut duplicates = 0usize;
        let mut errors = Vec::new();

        for block in ctx.block_names() {
            let Some(records) = ctx.take_block(&block) else {
                continue;
            };
            let mut kept = Vec::with_capacity(records.len());
            for mut record in records {
                match self.process_record(&mut record).await {
                    Outcome::PassThrough => kept.push(record),
                    Outcome::Extracted => {
                        processed += 1;
                        kept.push(record);
                    }
                    Outcome::Duplicate => {
                        duplicates += 1;
                        debug!(url = %record.identity_url(), "dropping already known document");
                    }
                    Outcome::Failed(error) => {
                        errors.push(json!({ "url": record.identity_url(), "error": error }));
                    }
                }
            }
            ctx.set_block(block, kept);
        }

        info!(
            "Processing finished: {} files, {} duplicates, {} errors",
            processed,
            duplicates,
            errors.len()
        );
        ctx.set_meta(
            KEY_PROCESSING_STATS,
            json!({
                "timestamp": Local::now().to_rfc3339(),
                "processed_files": processed,
                "duplicates": duplicates,
                "errors": errors,
            }),
        );
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "processing"
    }
}
