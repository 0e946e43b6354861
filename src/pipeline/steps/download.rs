use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PipelineStage;
use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::{Config, DownloadConfig};
use crate::constants::{KEY_DOWNLOAD_STATS, MAX_DOWNLOAD_ATTEMPTS};
use crate::domain::{DownloadStatus, PipelineContext, Record, StageOutput};
use crate::error::Result;
use crate::metrics::DownloadMetrics;
use crate::pipeline::processing::transforms::{is_downloadable, strip_query, TransformContext, UrlResolver};
use crate::pipeline::storage::DedupStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Fetched {
    bytes: Vec<u8>,
    final_url: String,
}

/// Pulls linked assets into `file_content`, with bounded retry and a one-shot TLS fallback.
pub struct DownloadStage {
    config: Arc<Config>,
    policy: DownloadConfig,
    http: Arc<dyn HttpClientPort>,
    dedup: Arc<dyn DedupStore>,
    urls: Arc<UrlResolver>,
}

impl DownloadStage {
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpClientPort>,
        dedup: Arc<dyn DedupStore>,
        urls: Arc<UrlResolver>,
    ) -> Self {
        let policy = config.download.clone().unwrap_or_default();
        Self {
            config,
            policy,
            http,
            dedup,
            urls,
        }
    }

    /// One attempt. A TLS failure with verification on is retried once without it.
    async fn attempt(&self, url: &str) -> std::result::Result<Fetched, String> {
        let fetch = &self.config.source.fetch;
        let request = HttpRequest::get(url)
            .with_headers(&fetch.headers)
            .with_timeout(self.policy.timeout())
            .with_verify_tls(fetch.verify_ssl);

        let resp = match self.http.get(&request).await {
            Err(e) if e.is_tls() && request.verify_tls => {
                DownloadMetrics::record_tls_fallback();
                warn!(url, "TLS verification failed, retrying without it: {}", e);
                self.http.get(&request.clone().with_verify_tls(false)).await
            }
            other => other,
        }
        .map_err(|e| e.to_string())?;

        if !resp.is_success() {
            return Err(format!("HTTP status {}", resp.status));
        }
        if resp.bytes.is_empty() {
            return Err("empty body".to_string());
        }
        let final_url = if resp.final_url.is_empty() {
            url.to_string()
        } else {
            resp.final_url
        };
        Ok(Fetched {
            bytes: resp.bytes,
            final_url,
        })
    }

    async fn download(&self, record: &mut Record, url: &str) -> bool {
        let mut last_error = String::new();
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            DownloadMetrics::record_attempt();
            debug!(url, attempt, "download attempt");
            match self.attempt(url).await {
                Ok(fetched) => {
                    DownloadMetrics::record_bytes(fetched.bytes.len());
                    info!("Downloaded {} bytes from {}", fetched.bytes.len(), url);
                    record.file_content = Some(fetched.bytes);
                    record.final_url = Some(fetched.final_url);
                    record.download_status = Some(DownloadStatus::Success);
                    record.download_error = None;
                    return true;
                }
                Err(e) => {
                    warn!(url, attempt, "download failed: {}", e);
                    last_error = e;
                }
            }
            if attempt < MAX_DOWNLOAD_ATTEMPTS {
                tokio::time::sleep(self.policy.retry_delay()).await;
            }
        }
        record.download_status = Some(DownloadStatus::Failed);
        record.download_error = Some(format!(
            "failed after {MAX_DOWNLOAD_ATTEMPTS} attempts: {last_error}"
        ));
        false
    }

    async fn process_record(&self, record: &mut Record, base: &str, stats: &mut DownloadStats) {
        let candidate = record.identity_url().trim().to_string();
        if candidate.is_empty() {
            record.download_status = Some(DownloadStatus::Skipped);
            stats.skipped += 1;
            return;
        }

        match self.dedup.exists_by_url(&candidate).await {
            Ok(true) => {
                debug!(url = %candidate, "already known, not downloading");
                record.download_status = Some(DownloadStatus::Skipped);
                stats.skipped += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(url = %candidate, "dedup lookup failed, downloading anyway: {}", e),
        }

        let tctx = TransformContext {
            template: &self.config.template_name,
            base_url: base,
        };
        let target = self.urls.smart_url(&candidate, &tctx).await;
        if !is_downloadable(&target, &self.policy.extensions) {
            debug!(url = %target, "not a downloadable asset");
            record.download_status = Some(DownloadStatus::Skipped);
            stats.skipped += 1;
            return;
        }

        if self.download(record, &target).await {
            stats.success += 1;
        } else {
            stats.failed += 1;
        }
    }
}

#[async_trait]
impl PipelineStage for DownloadStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let base = strip_query(ctx.source_url().unwrap_or(self.config.source.url.as_str()));
        let mut stats = DownloadStats::default();

        for block in ctx.block_names() {
            let Some(mut records) = ctx.take_block(&block) else {
                continue;
            };
            stats.total += records.len();
            for record in records.iter_mut() {
                self.process_record(record, &base, &mut stats).await;
            }
            ctx.set_block(block, records);
        }

        DownloadMetrics::record_outcomes("success", stats.success);
        DownloadMetrics::record_outcomes("skipped", stats.skipped);
        DownloadMetrics::record_outcomes("failed", stats.failed);
        info!(
            "Download finished: total={} success={} skipped={} failed={}",
            stats.total, stats.success, stats.skipped, stats.failed
        );
        ctx.set_meta(
            KEY_DOWNLOAD_STATS,
            json!({
                "total": stats.total,
                "success": stats.success,
                "skipped": stats.skipped,
                "failed": stats.failed,
            }),
        );
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "download"
    }
}
