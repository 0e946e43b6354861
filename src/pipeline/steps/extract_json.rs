use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::field_rules::{build_record, CompiledBlock, CompiledField};
use super::PipelineStage;
use crate::config::FieldRule;
use crate::domain::{value_to_string, PipelineContext, Record, SourceDocument, StageOutput, RESERVED_FIELDS};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::json_path::JsonPath;
use crate::pipeline::processing::transforms::{strip_query, TransformContext, UrlResolver};

/// Path-based extraction over a parsed JSON source.
pub struct JsonExtractStage {
    template_name: String,
    blocks: Vec<CompiledBlock>,
    urls: Arc<UrlResolver>,
}

/// Items selected by a block path: arrays yield their elements, a single value is a
/// one-item list, and null or empty items are skipped.
pub fn select_items(root: &Value, selector: &str) -> std::result::Result<Vec<Value>, String> {
    let selected = JsonPath::parse(selector)?.evaluate(root).unwrap_or(Value::Null);
    let items = match selected {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    Ok(items.into_iter().filter(|v| !is_empty_item(v)).collect())
}

fn is_empty_item(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn raw_value(item: &Value, field: &CompiledField) -> Value {
    let path = match &field.rule {
        FieldRule::Shorthand(path) => Some(path.as_str()),
        FieldRule::Structured(spec) => spec.attr.as_deref(),
    };
    let Some(path) = path else {
        return Value::Null;
    };
    match JsonPath::parse(path) {
        Ok(p) => p.evaluate(item).unwrap_or_else(|| Value::String(String::new())),
        Err(e) => {
            warn!(field = %field.name, "invalid path '{}': {}", path, e);
            Value::String(String::new())
        }
    }
}

/// Typed record fields a template may still declare as content.
const CONTENT_FIELDS: &[&str] = &["title"];

/// `field: value` lines over the block's declared scalar fields, in field order.
/// Links and pipeline-owned fields are left out.
fn synthesize_text(fields: &[CompiledField], record: &Record) -> Option<String> {
    let lines: Vec<String> = fields
        .iter()
        .map(|f| f.name.as_str())
        .filter(|name| CONTENT_FIELDS.contains(name) || !RESERVED_FIELDS.contains(name))
        .filter_map(|name| {
            let value = match record.extra.get(name) {
                Some(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => value_to_string(v),
                Some(_) => return None,
                None => record.field_str(name)?,
            };
            (!value.trim().is_empty()).then(|| format!("{name}: {value}"))
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

impl JsonExtractStage {
    pub fn new(template_name: impl Into<String>, blocks: Vec<CompiledBlock>, urls: Arc<UrlResolver>) -> Self {
        Self {
            template_name: template_name.into(),
            blocks,
            urls,
        }
    }

    async fn build_block(&self, block: &CompiledBlock, root: &Value, base: &str) -> Vec<Record> {
        let items = match select_items(root, &block.selector) {
            Ok(items) => items,
            Err(e) => {
                warn!("Block '{}': {}", block.name, e);
                return Vec::new();
            }
        };
        let tctx = TransformContext {
            template: &self.template_name,
            base_url: base,
        };
        let has_text_rule = block.fields.iter().any(|f| f.name == "text");
        let limit = block.limit.unwrap_or(usize::MAX);

        let mut records = Vec::new();
        for item in items.iter().take(limit) {
            let raws = block.fields.iter().map(|f| raw_value(item, f)).collect();
            let (mut record, _) = build_record(&block.fields, raws, &tctx, &self.urls).await;
            if !has_text_rule {
                record.text = synthesize_text(&block.fields, &record);
            }
            records.push(record);
        }
        records
    }
}

#[async_trait]
impl PipelineStage for JsonExtractStage {
    async fn run(&self, ctx: PipelineContext) -> Result<StageOutput> {
        let root = match ctx.document() {
            Some(SourceDocument::Json(v)) => v.clone(),
            Some(other) => {
                return Err(PipelineError::Stage {
                    stage: "json_extract",
                    message: format!("expected a JSON document, got {}", other.kind()),
                })
            }
            None => Value::Null,
        };
        if root.is_null() {
            warn!("JSON source is empty; blocks will be empty");
        }
        let base = strip_query(ctx.source_url().unwrap_or_default());

        let mut patch = PipelineContext::new();
        for block in &self.blocks {
            let records = self.build_block(block, &root, &base).await;
            info!("Block '{}': {} records", block.name, records.len());
            patch.set_block(block.name.clone(), records);
        }
        Ok(StageOutput::Merge { context: ctx, patch })
    }

    fn name(&self) -> &'static str {
        "json_extract"
    }
}
