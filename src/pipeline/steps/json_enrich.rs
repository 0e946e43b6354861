use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::html_enrich::merge_enrich_stats;
use super::PipelineStage;
use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::Config;
use crate::domain::{DownloadStatus, PipelineContext, Record, StageOutput};
use crate::error::Result;

/// Replaces each record's `text` with the pretty-printed JSON behind its URL.
pub struct JsonEnrichStage {
    config: Arc<Config>,
    http: Arc<dyn HttpClientPort>,
}

fn is_empty_json(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}

impl JsonEnrichStage {
    pub fn new(config: Arc<Config>, http: Arc<dyn HttpClientPort>) -> Self {
        Self { config, http }
    }

    async fn enrich(&self, record: &mut Record) -> Option<DownloadStatus> {
        let url = record.identity_url().trim().to_string();
        if url.is_empty() {
            return None;
        }
        let fetch = &self.config.source.fetch;
        let request = HttpRequest::get(&url)
            .with_headers(&fetch.headers)
            .with_timeout(fetch.timeout())
            .with_verify_tls(fetch.verify_ssl);
        let resp = match self.http.get(&request).await {
            Ok(resp) if resp.is_success() => resp,
            Ok(resp) => {
                warn!(url = %url, "details returned HTTP {}", resp.status);
                return Some(DownloadStatus::JsonError);
            }
            Err(e) => {
                warn!(url = %url, "details load failed: {}", e);
                return Some(DownloadStatus::JsonError);
            }
        };
        let value: Value = match serde_json::from_slice(&resp.bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(url = %url, "details are not JSON: {}", e);
                return Some(DownloadStatus::JsonInvalid);
            }
        };
        if is_empty_json(&value) {
            return Some(DownloadStatus::JsonEmpty);
        }
        match serde_json::to_string_pretty(&value) {
            Ok(text) => {
                record.text = Some(text);
                Some(DownloadStatus::JsonSuccess)
            }
            Err(_) => Some(DownloadStatus::JsonInvalid),
        }
    }
}

#[async_trait]
impl PipelineStage for JsonEnrichStage {
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
        info!("JSON enrichment finished: {:?}", counts);
        merge_enrich_stats(&mut ctx, "json", &counts);
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "json_enrich"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge_output;
    use crate::pipeline::steps::test_support::{ok, ScriptedHttp};

    #[tokio::test]
    async fn classifies_detail_bodies() {
        let config = Arc::new(
            Config::from_toml_str("template_name = \"t\"\n[source]\ntype = \"json\"\nurl = \"https://api.example.org/\"\n")
                .unwrap(),
        );
        let http = Arc::new(
            ScriptedHttp::new()
                .on("https://api.example.org/1", ok(r#"{"title":"Plan"}"#))
                .on("https://api.example.org/2", ok("{}"))
                .on("https://api.example.org/3", ok("<html>")),
        );
        let mut ctx = PipelineContext::new();
        ctx.set_block(
            "items",
            (1..=4).map(|i| Record::new(format!("https://api.example.org/{i}"))).collect(),
        );

        let stage = JsonEnrichStage::new(config, http);
        let out = merge_output("json_enrich", stage.run(ctx).await.unwrap());
        let statuses: Vec<_> = out
            .block("items")
            .unwrap()
            .iter()
            .map(|r| r.download_status.unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::JsonSuccess,
                DownloadStatus::JsonEmpty,
                DownloadStatus::JsonInvalid,
                DownloadStatus::JsonError
            ]
        );
        assert_eq!(
            out.block("items").unwrap()[0].text.as_deref(),
            Some("{\n  \"title\": \"Plan\"\n}")
        );
    }
}
