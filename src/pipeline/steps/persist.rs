use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::PipelineStage;
use crate::constants::KEY_PERSIST_STATS;
use crate::domain::{PipelineContext, StageOutput};
use crate::error::Result;
use crate::metrics::StateMetrics;
use crate::pipeline::storage::DedupStore;

/// Records every surviving record as an event. Known records leave the context so
/// later stages only see what is new. Records without a URL cannot be deduplicated
/// and are dropped unsaved.
pub struct PersistStage {
    template_name: String,
    dedup: Arc<dyn DedupStore>,
}

impl PersistStage {
    pub fn new(template_name: impl Into<String>, dedup: Arc<dyn DedupStore>) -> Self {
        Self {
            template_name: template_name.into(),
            dedup,
        }
    }
}

#[async_trait]
impl PipelineStage for PersistStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let (mut saved, mut known, mut failed, mut no_url) = (0usize, 0usize, 0usize, 0usize);

        for block in ctx.block_names() {
            let Some(records) = ctx.take_block(&block) else {
                continue;
            };
            let mut fresh = Vec::with_capacity(records.len());
            for record in records {
                if record.identity_url().trim().is_empty() {
                    no_url += 1;
                    warn!(title = record.title.as_deref().unwrap_or_default(), "record has no URL, not persisted");
                    continue;
                }
                match self.dedup.save(&record, &self.template_name).await {
                    Ok(true) => {
                        saved += 1;
                        fresh.push(record);
                    }
                    Ok(false) => {
                        known += 1;
                        debug!(url = %record.identity_url(), "already known");
                    }
                    Err(e) => {
                        failed += 1;
                        StateMetrics::record_store_error();
                        error!(url = %record.identity_url(), "Failed to persist record: {}", e);
                        fresh.push(record);
                    }
                }
            }
            ctx.set_block(block, fresh);
        }

        StateMetrics::record_saved(saved);
        StateMetrics::record_known(known);
        info!(
            "Persisted {} new events ({} known, {} failed, {} without URL)",
            saved, known, failed, no_url
        );
        ctx.set_meta(
            KEY_PERSIST_STATS,
            json!({ "saved": saved, "known": known, "failed": failed, "skipped_no_url": no_url }),
        );
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "persist"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{merge_output, Record};
    use crate::pipeline::storage::{InMemoryStore, StoreError, StoreResult};

    fn titled(url: &str) -> Record {
        let mut r = Record::new(url);
        r.title = Some(format!("Title of {url}"));
        r
    }

    fn context(urls: &[&str]) -> PipelineContext {
        let mut ctx = PipelineContext::new();
        ctx.set_block("docs", urls.iter().map(|u| titled(u)).collect());
        ctx
    }

    #[tokio::test]
    async fn second_pass_keeps_nothing() {
        let store = InMemoryStore::new();
        let stage = PersistStage::new("t", Arc::new(store.clone()));

        let first = merge_output("persist", stage.run(context(&["https://a.org/1", "https://a.org/2"])).await.unwrap());
        assert_eq!(first.block("docs").unwrap().len(), 2);
        assert_eq!(store.count().await.unwrap(), 2);

        let second = merge_output("persist", stage.run(context(&["https://a.org/1", "https://a.org/2"])).await.unwrap());
        assert!(second.block("docs").unwrap().is_empty());
        assert_eq!(second.meta(KEY_PERSIST_STATS).unwrap(), &json!({"saved": 0, "known": 2, "failed": 0, "skipped_no_url": 0}));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn records_without_url_are_never_saved() {
        let store = InMemoryStore::new();
        let stage = PersistStage::new("t", Arc::new(store.clone()));
        let mut ctx = PipelineContext::new();
        ctx.set_block(
            "docs",
            ["Budget hearing", "Road works", "Water outage"].iter().map(|t| titled_without_url(t)).collect(),
        );

        let out = merge_output("persist", stage.run(ctx).await.unwrap());
        assert!(out.block("docs").unwrap().is_empty());
        assert_eq!(
            out.meta(KEY_PERSIST_STATS).unwrap(),
            &json!({"saved": 0, "known": 0, "failed": 0, "skipped_no_url": 3})
        );
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!store.exists_by_url("").await.unwrap());
    }

    fn titled_without_url(title: &str) -> Record {
        let mut r = Record::new("");
        r.title = Some(title.to_string());
        r
    }

    struct BrokenStore;

    #[async_trait]
    impl DedupStore for BrokenStore {
        async fn exists_by_url(&self, _url: &str) -> StoreResult<bool> {
            Ok(false)
        }
        async fn exists_by_fingerprint(&self, _record: &Record) -> StoreResult<bool> {
            Ok(false)
        }
        async fn save(&self, _record: &Record, _template_name: &str) -> StoreResult<bool> {
            Err(StoreError::Poisoned)
        }
        async fn count(&self) -> StoreResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn store_failures_are_counted_and_records_kept() {
        let stage = PersistStage::new("t", Arc::new(BrokenStore));
        let out = merge_output("persist", stage.run(context(&["https://a.org/1"])).await.unwrap());
        assert_eq!(out.block("docs").unwrap().len(), 1);
        assert_eq!(out.meta(KEY_PERSIST_STATS).unwrap()["failed"], json!(1));
    }
}
