use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::PipelineStage;
use crate::app::ports::{HttpClientPort, HttpRequest, HttpResponse};
use crate::config::{Config, SourceType};
use crate::constants::KEY_SOURCE_URL;
use crate::domain::{PipelineContext, SourceDocument, StageOutput};
use crate::error::{PipelineError, Result};
use crate::metrics::FetchMetrics;
use crate::pipeline::processing::template::Template;

/// Retrieves the source document. Always the first stage; any failure aborts the run.
pub struct FetchStage {
    config: Arc<Config>,
    http: Arc<dyn HttpClientPort>,
}

impl FetchStage {
    pub fn new(config: Arc<Config>, http: Arc<dyn HttpClientPort>) -> Self {
        Self { config, http }
    }

    /// Source URL with template expressions (`now`, filters) evaluated.
    pub fn render_url(&self) -> Result<String> {
        let meta = serde_json::to_value(&self.config.meta).unwrap_or(Value::Null);
        let ctx = json!({ "meta": meta, "template_name": self.config.template_name });
        Ok(Template::parse(&self.config.source.url)?.render(&ctx)?.trim().to_string())
    }
}

/// Classify the body by the declared source type. Malformed JSON becomes `null`.
pub fn classify(kind: SourceType, resp: &HttpResponse) -> SourceDocument {
    match kind {
        SourceType::Html => SourceDocument::Html(resp.text()),
        SourceType::Xml => SourceDocument::Xml(resp.text()),
        SourceType::Json => match serde_json::from_slice(&resp.bytes) {
            Ok(value) => SourceDocument::Json(value),
            Err(e) => {
                warn!("Source body is not valid JSON: {}", e);
                SourceDocument::Json(Value::Null)
            }
        },
    }
}

#[async_trait]
impl PipelineStage for FetchStage {
    async fn run(&self, ctx: PipelineContext) -> Result<StageOutput> {
        let url = self.render_url()?;
        let fetch = &self.config.source.fetch;
        let request = HttpRequest::get(&url)
            .with_headers(&fetch.headers)
            .with_timeout(fetch.timeout())
            .with_verify_tls(fetch.verify_ssl);

        info!("Fetching source {}", url);
        let started = Instant::now();
        let resp = self.http.get(&request).await.map_err(|e| {
            FetchMetrics::record_error("transport");
            PipelineError::Fetch {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        if !resp.is_success() {
            FetchMetrics::record_error("status");
            return Err(PipelineError::Fetch {
                url,
                reason: format!("HTTP status {}", resp.status),
            });
        }

        let kind = self.config.source.kind;
        FetchMetrics::record_success(kind.as_str(), started.elapsed().as_secs_f64(), resp.bytes.len());
        info!("Fetched {} bytes of {} from {}", resp.bytes.len(), kind.as_str(), url);

        let mut patch = PipelineContext::new();
        patch.set_meta(KEY_SOURCE_URL, json!(url));
        patch.set_document(classify(kind, &resp));
        Ok(StageOutput::Merge { context: ctx, patch })
    }

    fn name(&self) -> &'static str {
        "fetch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge_output;
    use crate::pipeline::steps::test_support::{ok, status, ScriptedHttp};

    fn config(kind: &str, url: &str) -> Arc<Config> {
        let toml = format!(
            "template_name = \"t\"\n[source]\ntype = \"{kind}\"\nurl = \"{url}\"\n"
        );
        Arc::new(Config::from_toml_str(&toml).unwrap())
    }

    #[tokio::test]
    async fn stores_document_and_source_url() {
        let http = Arc::new(ScriptedHttp::new().on("https://a.org/feed", ok(r#"{"items": [1]}"#)));
        let stage = FetchStage::new(config("json", "https://a.org/feed"), http);
        let ctx = merge_output("fetch", stage.run(PipelineContext::new()).await.unwrap());
        assert_eq!(ctx.source_url(), Some("https://a.org/feed"));
        assert_eq!(ctx.document(), Some(&SourceDocument::Json(json!({"items": [1]}))));
    }

    #[tokio::test]
    async fn malformed_json_becomes_null() {
        let http = Arc::new(ScriptedHttp::new().on("https://a.org/feed", ok("not json")));
        let stage = FetchStage::new(config("json", "https://a.org/feed"), http);
        let ctx = merge_output("fetch", stage.run(PipelineContext::new()).await.unwrap());
        assert_eq!(ctx.document(), Some(&SourceDocument::Json(Value::Null)));
    }

    #[tokio::test]
    async fn non_success_status_aborts() {
        let http = Arc::new(ScriptedHttp::new().on("https://a.org/", status(503)));
        let stage = FetchStage::new(config("html", "https://a.org/"), http);
        let err = stage.run(PipelineContext::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
    }

    #[tokio::test]
    async fn url_templates_are_rendered() {
        let http = Arc::new(ScriptedHttp::new());
        let stage = FetchStage::new(
            config("html", "https://a.org/?d={{ now | date(\\\"%Y\\\") }}"),
            http,
        );
        let url = stage.render_url().unwrap();
        assert!(url.starts_with("https://a.org/?d=20"));
        assert!(!url.contains("{{"));
    }
}
