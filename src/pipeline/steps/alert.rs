use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::PipelineStage;
use crate::app::ports::AlertRenderer;
use crate::config::AlertConfig;
use crate::constants::KEY_ALERT;
use crate::domain::{PipelineContext, StageOutput};
use crate::error::Result;
use crate::pipeline::processing::template::{self, TemplateError};

/// Default renderer backed by the built-in template engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateAlertRenderer;

impl AlertRenderer for TemplateAlertRenderer {
    fn render(&self, _name: &str, template: &str, context: &Value) -> std::result::Result<String, TemplateError> {
        template::render(template, context)
    }
}

/// Renders every alert template against the final context. One failing template
/// does not stop the others.
pub struct AlertStage {
    templates: Vec<(String, String)>,
    renderer: Arc<dyn AlertRenderer>,
}

impl AlertStage {
    pub fn new(config: &AlertConfig, renderer: Arc<dyn AlertRenderer>) -> Self {
        Self {
            templates: config
                .templates
                .iter()
                .map(|(name, body)| (name.clone(), body.clone()))
                .collect(),
            renderer,
        }
    }
}

#[async_trait]
impl PipelineStage for AlertStage {
    async fn run(&self, ctx: PipelineContext) -> Result<StageOutput> {
        let view = ctx.to_json();
        let mut rendered = Map::new();
        for (name, body) in &self.templates {
            let text = match self.renderer.render(name, body, &view) {
                Ok(text) => {
                    info!("Alert '{}':\n{}", name, text);
                    text
                }
                Err(e) => {
                    warn!("Alert '{}' failed to render: {}", name, e);
                    format!("Render error for '{name}': {e}")
                }
            };
            rendered.insert(name.clone(), Value::String(text));
        }

        let mut patch = PipelineContext::new();
        patch.set_meta(KEY_ALERT, Value::Object(rendered));
        Ok(StageOutput::Merge { context: ctx, patch })
    }

    fn name(&self) -> &'static str {
        "alert"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{merge_output, Record};
    use indexmap::IndexMap;

    #[tokio::test]
    async fn renders_each_template_and_isolates_failures() {
        let mut templates = IndexMap::new();
        templates.insert(
            "digest".to_string(),
            "{% for e in events %}- {{ e.title }}\n{% endfor %}total: {{ events | length }}".to_string(),
        );
        templates.insert("broken".to_string(), "{% for e in events %}never closed".to_string());
        templates.insert("stamp".to_string(), "{{ now | date(\"%Y\") }}".to_string());
        let stage = AlertStage::new(&AlertConfig { templates }, Arc::new(TemplateAlertRenderer));

        let mut ctx = PipelineContext::new();
        let mut r = Record::new("https://a.org/1");
        r.title = Some("Road works".to_string());
        ctx.set_block("events", vec![r]);

        let out = merge_output("alert", stage.run(ctx).await.unwrap());
        let alert = out.meta(KEY_ALERT).unwrap();
        assert_eq!(alert["digest"], Value::String("- Road works\ntotal: 1".to_string()));
        assert!(alert["broken"].as_str().unwrap().starts_with("Render error for 'broken'"));
        assert_eq!(alert["stamp"].as_str().unwrap().len(), 4);
        assert_eq!(out.block("events").unwrap().len(), 1);
    }
}
