//! Composes the stage list for a template and runs it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, instrument, Instrument};

use crate::app::ports::{AlertRenderer, HttpClientPort, PdfTextExtractor, TextGenerator};
use crate::config::{Config, SourceType};
use crate::constants::{DEFAULT_OCR_LANG, PREVIEW_CHARS};
use crate::domain::{merge_output, ContextValue, PipelineContext};
use crate::error::{ConfigError, Result};
use crate::infra::PopplerPdfExtractor;
use crate::metrics::RunMetrics;
use crate::pipeline::processing::transforms::{TransformRegistry, UrlResolver};
use crate::pipeline::steps::field_rules::compile_blocks;
use crate::pipeline::steps::{
    AlertStage, DownloadStage, FetchStage, HtmlEnrichStage, JsonEnrichStage, JsonExtractStage,
    MarkupExtractStage, NormalizeStage, PersistStage, PipelineStage, ProcessingStage, StageKind,
    SummarizeStage, TemplateAlertRenderer,
};
use crate::pipeline::storage::{DedupStore, TransformCache};

/// Ordered stage kinds for a template. Depends only on which sections are declared.
pub fn compose(config: &Config) -> Vec<StageKind> {
    let mut stages = vec![StageKind::Fetch];
    if config.extract.is_some() {
        stages.push(match config.source.kind {
            SourceType::Json => StageKind::ExtractJson,
            SourceType::Html | SourceType::Xml => StageKind::ExtractMarkup,
        });
    }
    if let Some(download) = &config.download {
        stages.push(StageKind::Download);
        if download.allow_html {
            stages.push(StageKind::HtmlEnrich);
        }
        if download.allow_json {
            stages.push(StageKind::JsonEnrich);
        }
    }
    if config.processing.is_some() {
        stages.push(StageKind::Process);
    }
    if config.normalize.is_some() {
        stages.push(StageKind::Normalize);
    }
    if config.summarize.is_some() {
        stages.push(StageKind::Summarize);
    }
    if config.extract.is_some() {
        stages.push(StageKind::Persist);
    }
    if config.alert.is_some() {
        stages.push(StageKind::Alert);
    }
    stages
}

/// Collaborators the stages are built from.
pub struct PipelineDeps {
    pub http: Arc<dyn HttpClientPort>,
    pub dedup: Arc<dyn DedupStore>,
    pub cache: Arc<dyn TransformCache>,
    pub pdf: Arc<dyn PdfTextExtractor>,
    pub generator: Option<Arc<dyn TextGenerator>>,
    pub renderer: Arc<dyn AlertRenderer>,
    pub transforms: TransformRegistry,
    /// Replaces the resolver built from `http` and `cache`.
    pub urls: Option<Arc<UrlResolver>>,
}

impl PipelineDeps {
    /// Defaults around one store that serves as both dedup store and transform cache.
    pub fn new<S>(http: Arc<dyn HttpClientPort>, store: Arc<S>) -> Self
    where
        S: DedupStore + TransformCache + 'static,
    {
        Self {
            http,
            dedup: store.clone(),
            cache: store,
            pdf: Arc::new(PopplerPdfExtractor::new(DEFAULT_OCR_LANG)),
            generator: None,
            renderer: Arc::new(TemplateAlertRenderer),
            transforms: TransformRegistry::new(),
            urls: None,
        }
    }

    pub fn with_pdf(mut self, pdf: Arc<dyn PdfTextExtractor>) -> Self {
        self.pdf = pdf;
        self
    }

    pub fn with_generator(mut self, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn AlertRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_urls(mut self, urls: Arc<UrlResolver>) -> Self {
        self.urls = Some(urls);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub context: PipelineContext,
    pub duration: Duration,
    /// Present for dry runs.
    pub preview: Option<Vec<String>>,
}

/// Built stages for one template, ready to run.
pub struct PipelineRunner {
    config: Arc<Config>,
    stages: Vec<(StageKind, Box<dyn PipelineStage>)>,
}

impl PipelineRunner {
    /// Build every composed stage. Selector rules, transform names and patterns are
    /// checked here so a bad template fails before anything is fetched.
    pub fn new(config: Arc<Config>, deps: PipelineDeps) -> std::result::Result<Self, ConfigError> {
        let urls = deps
            .urls
            .clone()
            .unwrap_or_else(|| Arc::new(UrlResolver::new(deps.http.clone(), deps.cache.clone())));
        let template = config.template_name.clone();

        let mut stages: Vec<(StageKind, Box<dyn PipelineStage>)> = Vec::new();
        for kind in compose(&config) {
            let stage: Box<dyn PipelineStage> = match kind {
                StageKind::Fetch => Box::new(FetchStage::new(config.clone(), deps.http.clone())),
                StageKind::ExtractMarkup | StageKind::ExtractJson => {
                    let blocks = match &config.extract {
                        Some(blocks) => compile_blocks(blocks, &deps.transforms)?,
                        None => Vec::new(),
                    };
                    if kind == StageKind::ExtractJson {
                        Box::new(JsonExtractStage::new(template.clone(), blocks, urls.clone())) as Box<dyn PipelineStage>
                    } else {
                        Box::new(MarkupExtractStage::new(template.clone(), blocks, urls.clone()))
                    }
                }
                StageKind::Download => Box::new(DownloadStage::new(
                    config.clone(),
                    deps.http.clone(),
                    deps.dedup.clone(),
                    urls.clone(),
                )),
                StageKind::HtmlEnrich => Box::new(HtmlEnrichStage::new(
                    config.clone(),
                    deps.http.clone(),
                    deps.dedup.clone(),
                )),
                StageKind::JsonEnrich => Box::new(JsonEnrichStage::new(config.clone(), deps.http.clone())),
                StageKind::Process => Box::new(ProcessingStage::new(
                    config.processing.clone().unwrap_or_default(),
                    deps.pdf.clone(),
                    deps.dedup.clone(),
                )?),
                StageKind::Normalize => match &config.normalize {
                    Some(rules) => Box::new(NormalizeStage::new(rules)?),
                    None => continue,
                },
                StageKind::Summarize => match &config.summarize {
                    Some(summarize) => Box::new(SummarizeStage::new(
                        summarize,
                        deps.generator.clone(),
                        deps.dedup.clone(),
                    )?),
                    None => continue,
                },
                StageKind::Persist => Box::new(PersistStage::new(template.clone(), deps.dedup.clone())),
                StageKind::Alert => match &config.alert {
                    Some(alert) => Box::new(AlertStage::new(alert, deps.renderer.clone())),
                    None => continue,
                },
            };
            stages.push((kind, stage));
        }

        Ok(Self { config, stages })
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(kind, _)| kind.name()).collect()
    }

    pub async fn run(&self) -> Result<PipelineContext> {
        Ok(self.run_with_options(RunOptions::default()).await?.context)
    }

    /// Run every stage in order. The first stage error aborts the run.
    #[instrument(skip(self), fields(template = %self.config.template_name))]
    pub async fn run_with_options(&self, options: RunOptions) -> Result<RunSummary> {
        info!("🚀 Starting pipeline '{}' ({} stages)", self.config.template_name, self.stages.len());
        RunMetrics::record_run_started();
        let started = Instant::now();

        let mut ctx = PipelineContext::new();
        for (kind, stage) in &self.stages {
            let stage_started = Instant::now();
            let output = match stage.run(ctx).instrument(info_span!("stage", name = %kind)).await {
                Ok(output) => output,
                Err(e) => {
                    error!("Stage '{}' failed: {}", kind, e);
                    RunMetrics::record_run_finished(false, started.elapsed().as_secs_f64());
                    return Err(e);
                }
            };
            ctx = merge_output(stage.name(), output);
            let secs = stage_started.elapsed().as_secs_f64();
            RunMetrics::record_stage(kind.name(), secs, ctx.record_count());
            info!("✅ Stage '{}' done in {:.2}s ({} records)", kind, secs, ctx.record_count());
        }

        let duration = started.elapsed();
        RunMetrics::record_run_finished(true, duration.as_secs_f64());
        info!("🏁 Pipeline '{}' finished in {:.2}s", self.config.template_name, duration.as_secs_f64());

        let preview = options.dry_run.then(|| preview(&ctx));
        Ok(RunSummary {
            context: ctx,
            duration,
            preview,
        })
    }
}

/// One line per context key, each cut to a bounded width.
pub fn preview(ctx: &PipelineContext) -> Vec<String> {
    ctx.iter()
        .map(|(key, value)| {
            let rendered = match value {
                ContextValue::Records(records) => {
                    format!("{} records: {}", records.len(), serde_json::Value::Array(
                        records.iter().map(|r| r.to_json()).collect(),
                    ))
                }
                ContextValue::Document(doc) => format!("{} document", doc.kind()),
                ContextValue::Meta(v) => v.to_string(),
            };
            format!("{key}: {}", truncate(&rendered, PREVIEW_CHARS))
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::InMemoryStore;
    use crate::pipeline::steps::test_support::ScriptedHttp;
    use serde_json::json;

    const BASE: &str = r#"
        template_name = "t"
        [source]
        type = "html"
        url = "https://example.org/"
        [extract.events]
        selector = ".item"
        [extract.events.fields]
        title = "self"
        url = "href"
    "#;

    #[test]
    fn composition_follows_declared_sections() {
        let config = Config::from_toml_str(&format!(
            "{BASE}\n[download]\nallow_html = true\n[normalize]\nrules = []\n[alert.templates]\na = \"x\"\n"
        ))
        .unwrap();
        let names: Vec<_> = compose(&config).iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec!["fetch", "extract", "download", "html_enrich", "normalize", "persist", "alert"]
        );
        assert_eq!(compose(&config), compose(&config));
    }

    #[test]
    fn json_sources_get_the_path_extractor() {
        let config = Config::from_toml_str(&BASE.replace("type = \"html\"", "type = \"json\"")).unwrap();
        assert_eq!(compose(&config)[1], StageKind::ExtractJson);
    }

    #[test]
    fn fetch_only_without_extract() {
        let config = Config::from_toml_str(
            "template_name = \"t\"\n[source]\ntype = \"html\"\nurl = \"https://example.org/\"\n",
        )
        .unwrap();
        assert_eq!(compose(&config), vec![StageKind::Fetch]);
    }

    #[test]
    fn unknown_transform_fails_at_build_time() {
        let toml = BASE.replace("url = \"href\"", "url = { attr = \"href\", transform_type = \"rot13\" }");
        let config = Arc::new(Config::from_toml_str(&toml).unwrap());
        let deps = PipelineDeps::new(Arc::new(ScriptedHttp::new()), Arc::new(InMemoryStore::new()));
        assert!(PipelineRunner::new(config, deps).is_err());
    }

    #[test]
    fn preview_truncates_long_values() {
        let mut ctx = PipelineContext::new();
        ctx.set_meta("big", json!("x".repeat(500)));
        ctx.set_meta("small", json!(1));
        let lines = preview(&ctx);
        assert!(lines[0].ends_with("..."));
        assert_eq!(lines[0].chars().count(), "big: ".len() + PREVIEW_CHARS + 3);
        assert_eq!(lines[1], "small: 1");
    }
}
