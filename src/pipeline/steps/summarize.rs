use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PipelineStage;
use crate::app::ports::TextGenerator;
use crate::config::SummarizeConfig;
use crate::domain::{PipelineContext, Record, StageOutput};
use crate::error::{ConfigError, Result};
use crate::pipeline::processing::summary::{clean_response, parse_response, summary_input, PROMPT_SUFFIX};
use crate::pipeline::processing::template::Template;
use crate::pipeline::storage::DedupStore;

/// Sends each new record's text to the generator and keeps the parsed reply on the record.
pub struct SummarizeStage {
    prompt: Template,
    generator: Option<Arc<dyn TextGenerator>>,
    dedup: Arc<dyn DedupStore>,
}

impl SummarizeStage {
    pub fn new(
        config: &SummarizeConfig,
        generator: Option<Arc<dyn TextGenerator>>,
        dedup: Arc<dyn DedupStore>,
    ) -> std::result::Result<Self, ConfigError> {
        let prompt = Template::parse(&config.prompt).map_err(|e| ConfigError::Invalid {
            field: "summarize.prompt".to_string(),
            message: e.to_string(),
        })?;
        if generator.is_none() {
            warn!("No text generator configured; summaries will carry an error");
        }
        Ok(Self {
            prompt,
            generator,
            dedup,
        })
    }

    async fn is_known(&self, record: &Record) -> bool {
        match self.dedup.exists_by_url(record.identity_url()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!(url = %record.identity_url(), "dedup lookup failed: {}", e),
        }
        self.dedup.exists_by_fingerprint(record).await.unwrap_or(false)
    }

    fn render_prompt(&self, record: &Record, input: &str) -> std::result::Result<String, String> {
        let mut scope = match record.to_json() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        scope.insert("text".to_string(), json!(input));
        let rendered = self
            .prompt
            .render(&Value::Object(scope))
            .map_err(|e| format!("prompt render failed: {e}"))?;
        Ok(rendered + PROMPT_SUFFIX)
    }

    /// Returns the per-record response entry.
    async fn summarize(&self, record: &mut Record) -> Value {
        let Some(input) = summary_input(record).map(str::to_string) else {
            record.summary_error = Some("empty input text".to_string());
            return json!({ "error": "empty input text" });
        };
        let Some(generator) = &self.generator else {
            record.summary_error = Some("no text generator configured".to_string());
            return json!({ "error": "no text generator configured" });
        };
        let prompt = match self.render_prompt(record, &input) {
            Ok(p) => p,
            Err(e) => {
                record.summary_error = Some(e.clone());
                return json!({ "error": e });
            }
        };

        debug!(url = %record.identity_url(), chars = prompt.chars().count(), "sending prompt");
        match generator.generate(&prompt).await {
            Ok(raw) => {
                let fields = parse_response(&clean_response(&raw));
                let entry = json!({
                    "fields": &fields,
                    "prompt_length": prompt.chars().count(),
                    "response_length": raw.chars().count(),
                });
                record.summary = Some(fields);
                record.summary_error = None;
                entry
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(url = %record.identity_url(), "summarization failed: {}", message);
                record.summary_error = Some(message.clone());
                json!({ "error": message })
            }
        }
    }
}

#[async_trait]
impl PipelineStage for SummarizeStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let mut responses = Map::new();
        for block in ctx.block_names() {
            let Some(mut records) = ctx.take_block(&block) else {
                continue;
            };
            for (i, record) in records.iter_mut().enumerate() {
                if self.is_known(record).await {
                    debug!(url = %record.identity_url(), "already persisted, not summarized");
                    continue;
                }
                let entry = self.summarize(record).await;
                responses.insert(format!("{block}_{i}"), entry);
            }
            ctx.set_block(block, records);
        }
        info!("Summarized {} records", responses.len());
        Ok(StageOutput::Value {
            context: ctx,
            value: Value::Object(responses),
        })
    }

    fn name(&self) -> &'static str {
        "summarize"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge_output;
    use crate::pipeline::storage::InMemoryStore;
    use std::sync::Mutex;

    struct Echo {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if prompt.contains("explode") {
                anyhow::bail!("backend unavailable");
            }
            Ok("<think>hmm</think>\nDate: 12 May\nPlace: Main st\nnear the bridge [1]".to_string())
        }
    }

    fn record(url: &str, text: &str) -> Record {
        let mut r = Record::new(url);
        r.title = Some(url.to_string());
        r.text = Some(text.to_string());
        r
    }

    #[tokio::test]
    async fn parses_replies_and_captures_failures() {
        let store = InMemoryStore::new();
        let old = record("https://a.org/old", "old");
        store.save(&old, "t").await.unwrap();
        let echo = Arc::new(Echo {
            prompts: Mutex::new(Vec::new()),
        });
        let stage = SummarizeStage::new(
            &SummarizeConfig {
                prompt: "Summarize {{ title }}: {{ text }}".to_string(),
            },
            Some(echo.clone() as Arc<dyn TextGenerator>),
            Arc::new(store),
        )
        .unwrap();

        let mut ctx = PipelineContext::new();
        ctx.set_block(
            "docs",
            vec![record("https://a.org/1", "road works"), old, record("https://a.org/2", "explode")],
        );
        let out = merge_output("summarize", stage.run(ctx).await.unwrap());

        let prompts = echo.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with("Summarize https://a.org/1: road works"));
        assert!(prompts[0].ends_with(PROMPT_SUFFIX));

        let records = out.block("docs").unwrap();
        let summary = records[0].summary.as_ref().unwrap();
        assert_eq!(summary.get("date").map(String::as_str), Some("12 May"));
        assert_eq!(summary.get("place").map(String::as_str), Some("Main st near the bridge"));
        assert!(records[1].summary.is_none());
        assert_eq!(records[2].summary_error.as_deref(), Some("backend unavailable"));

        let responses = out.meta("summarize").unwrap();
        assert_eq!(responses["docs_0"]["fields"]["date"], json!("12 May"));
        assert!(responses.get("docs_1").is_none());
        assert_eq!(responses["docs_2"]["error"], json!("backend unavailable"));
    }

    #[tokio::test]
    async fn missing_generator_marks_records() {
        let stage = SummarizeStage::new(
            &SummarizeConfig {
                prompt: "{{ text }}".to_string(),
            },
            None,
            Arc::new(InMemoryStore::new()),
        )
        .unwrap();
        let mut ctx = PipelineContext::new();
        ctx.set_block("docs", vec![record("https://a.org/1", "x")]);
        let out = merge_output("summarize", stage.run(ctx).await.unwrap());
        assert!(out.block("docs").unwrap()[0].summary_error.is_some());
    }
}
