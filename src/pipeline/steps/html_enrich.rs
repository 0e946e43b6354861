use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::field_rules::normalize_ws;
use super::PipelineStage;
use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::Config;
use crate::constants::{KEY_ENRICH_STATS, MIN_PAGE_TEXT_CHARS};
use crate::domain::{DownloadStatus, PipelineContext, Record, StageOutput};
use crate::error::Result;
use crate::pipeline::storage::DedupStore;

/// Loads each record's own page and keeps its readable text in `page_text`.
pub struct HtmlEnrichStage {
    config: Arc<Config>,
    http: Arc<dyn HttpClientPort>,
    dedup: Arc<dyn DedupStore>,
}

/// Text of `selector` matches (one per line), or of the whole body without a selector.
pub fn page_text(body: &str, selector: Option<&str>) -> String {
    let document = Html::parse_document(body);
    if let Some(sel) = selector {
        match Selector::parse(sel) {
            Ok(sel) => {
                return document
                    .select(&sel)
                    .map(|el| normalize_ws(&el.text().collect::<String>()))
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            Err(e) => warn!("Invalid page selector '{}': {:?}", sel, e),
        }
    }
    let root = Selector::parse("body")
        .ok()
        .and_then(|body_sel| document.select(&body_sel).next())
        .unwrap_or_else(|| document.root_element());
    root.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fold per-kind counters into the shared `enrich_stats` entry.
pub(super) fn merge_enrich_stats(ctx: &mut PipelineContext, kind: &str, counts: &BTreeMap<&'static str, usize>) {
    let mut stats = ctx.meta(KEY_ENRICH_STATS).cloned().unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut stats {
        map.insert(kind.to_string(), json!(counts));
    }
    ctx.set_meta(KEY_ENRICH_STATS, stats);
}

impl HtmlEnrichStage {
    pub fn new(config: Arc<Config>, http: Arc<dyn HttpClientPort>, dedup: Arc<dyn DedupStore>) -> Self {
        Self { config, http, dedup }
    }

    async fn enrich(&self, record: &mut Record) -> Option<DownloadStatus> {
        let url = record.identity_url().trim().to_string();
        if url.is_empty() || record.page_text.is_some() {
            return None;
        }
        match self.dedup.exists_by_url(&url).await {
            Ok(true) => {
                debug!(url = %url, "already known, page not loaded");
                return None;
            }
            Ok(false) => {}
            Err(e) => warn!(url = %url, "dedup lookup failed: {}", e),
        }

        let fetch = &self.config.source.fetch;
        let request = HttpRequest::get(&url)
            .with_headers(&fetch.headers)
            .with_timeout(fetch.timeout())
            .with_verify_tls(fetch.verify_ssl);
        let body = match self.http.get(&request).await {
            Ok(resp) if resp.is_success() => resp.text(),
            Ok(resp) => {
                warn!(url = %url, "page returned HTTP {}", resp.status);
                return Some(DownloadStatus::HtmlError);
            }
            Err(e) => {
                warn!(url = %url, "page load failed: {}", e);
                return Some(DownloadStatus::HtmlError);
            }
        };

        let text = page_text(&body, fetch.selector.as_deref());
        if text.chars().count() <= MIN_PAGE_TEXT_CHARS {
            return Some(DownloadStatus::HtmlEmpty);
        }
        debug!(url = %url, chars = text.len(), "page text extracted");
        if record.text.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            record.text = Some(text.clone());
        }
        record.page_text = Some(text);
        Some(DownloadStatus::HtmlSuccess)
    }
}

#[async_trait]
impl PipelineStage for HtmlEnrichStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for block in ctx.block_names() {
            let Some(mut records) = ctx.take_block(&block) else {
                continue;
            };
            for record in records.iter_mut() {
                if let Some(status) = self.enrich(record).await {
                    record.download_status = Some(status);
                    *counts.entry(status.as_str()).or_default() += 1;
                }
            }
            ctx.set_block(block, records);
        }
        info!("HTML enrichment finished: {:?}", counts);
        merge_enrich_stats(&mut ctx, "html", &counts);
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "html_enrich"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge_output;
    use crate::pipeline::steps::test_support::{ok, ScriptedHttp};
    use crate::pipeline::storage::InMemoryStore;

    fn config(selector: Option<&str>) -> Arc<Config> {
        let mut toml = String::from(
            "template_name = \"t\"\n[source]\ntype = \"html\"\nurl = \"https://example.org/\"\n[source.fetch]\n",
        );
        if let Some(sel) = selector {
            toml.push_str(&format!("selector = \"{sel}\"\n"));
        }
        Arc::new(Config::from_toml_str(&toml).unwrap())
    }

    #[test]
    fn page_text_honours_selector() {
        let body = "<html><body><nav>menu</nav><div class=\"post\"> Hello   world </div></body></html>";
        assert_eq!(page_text(body, Some(".post")), "Hello world");
        assert_eq!(page_text(body, None), "menu\nHello   world");
    }

    #[tokio::test]
    async fn statuses_follow_page_length() {
        let long = format!("<div class=\"post\">{}</div>", "word ".repeat(20));
        let http = Arc::new(
            ScriptedHttp::new()
                .on("https://example.org/long", ok(long))
                .on("https://example.org/short", ok("<div class=\"post\">tiny</div>")),
        );
        let mut ctx = PipelineContext::new();
        let mut existing = Record::new("https://example.org/short");
        existing.text = Some("kept".into());
        ctx.set_block(
            "events",
            vec![Record::new("https://example.org/long"), existing, Record::new("https://example.org/missing")],
        );

        let stage = HtmlEnrichStage::new(config(Some(".post")), http, Arc::new(InMemoryStore::new()));
        let out = merge_output("html_enrich", stage.run(ctx).await.unwrap());
        let records = out.block("events").unwrap();

        assert_eq!(records[0].download_status, Some(DownloadStatus::HtmlSuccess));
        assert_eq!(records[0].text, records[0].page_text);
        assert_eq!(records[1].download_status, Some(DownloadStatus::HtmlEmpty));
        assert_eq!(records[1].text.as_deref(), Some("kept"));
        assert_eq!(records[2].download_status, Some(DownloadStatus::HtmlError));
        assert_eq!(out.meta(KEY_ENRICH_STATS).unwrap()["html"]["html_success"], json!(1));
    }
}
