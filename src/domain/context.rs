use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::constants::{KEY_DOCUMENT, KEY_SOURCE_URL};
use crate::domain::record::Record;

/// Body of the fetched source, classified by the declared source type.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDocument {
    Html(String),
    Xml(String),
    Json(Value),
}

impl SourceDocument {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDocument::Html(_) => "html",
            SourceDocument::Xml(_) => "xml",
            SourceDocument::Json(_) => "json",
        }
    }
}

/// A single named slot in the context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Document(SourceDocument),
    Records(Vec<Record>),
    Meta(Value),
}

/// State threaded through the stages. Each stage takes it by value and hands back a new one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineContext {
    entries: IndexMap<String, ContextValue>,
}

/// What a stage hands back to the engine.
#[derive(Debug)]
pub enum StageOutput {
    /// The complete context to continue with.
    Replace(PipelineContext),
    /// Keys merged over the context, overwriting same-named keys.
    Merge {
        context: PipelineContext,
        patch: PipelineContext,
    },
    /// A non-mapping result stored under the stage's own key.
    Value {
        context: PipelineContext,
        value: Value,
    },
}

/// Fold a stage result into the running context.
pub fn merge_output(stage_key: &str, output: StageOutput) -> PipelineContext {
    match output {
        StageOutput::Replace(context) => context,
        StageOutput::Merge { mut context, patch } => {
            context.entries.extend(patch.entries);
            context
        }
        StageOutput::Value { mut context, value } => {
            context.insert(stage_key, ContextValue::Meta(value));
            context
        }
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ContextValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.entries.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn document(&self) -> Option<&SourceDocument> {
        match self.entries.get(KEY_DOCUMENT) {
            Some(ContextValue::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    pub fn set_document(&mut self, doc: SourceDocument) {
        self.insert(KEY_DOCUMENT, ContextValue::Document(doc));
    }

    /// The rendered source URL recorded by the fetch stage.
    pub fn source_url(&self) -> Option<&str> {
        self.meta(KEY_SOURCE_URL).and_then(|v| v.as_str())
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(ContextValue::Meta(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.insert(key, ContextValue::Meta(value));
    }

    pub fn block(&self, name: &str) -> Option<&[Record]> {
        match self.entries.get(name) {
            Some(ContextValue::Records(records)) => Some(records),
            _ => None,
        }
    }

    pub fn set_block(&mut self, name: impl Into<String>, records: Vec<Record>) {
        self.insert(name, ContextValue::Records(records));
    }

    /// Take a block out, leaving its slot in place so block order is kept.
    pub fn take_block(&mut self, name: &str) -> Option<Vec<Record>> {
        match self.entries.get_mut(name) {
            Some(ContextValue::Records(records)) => Some(std::mem::take(records)),
            _ => None,
        }
    }

    pub fn block_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, v)| matches!(v, ContextValue::Records(_)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().flat_map(|v| match v {
            ContextValue::Records(records) => records.as_slice(),
            _ => &[] as &[Record],
        })
    }

    pub fn record_count(&self) -> usize {
        self.records().count()
    }

    /// JSON view for templates and previews. Binary content is never included.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.entries {
            let v = match value {
                ContextValue::Document(SourceDocument::Html(s))
                | ContextValue::Document(SourceDocument::Xml(s)) => json!(s),
                ContextValue::Document(SourceDocument::Json(v)) => v.clone(),
                ContextValue::Records(records) => {
                    Value::Array(records.iter().map(Record::to_json).collect())
                }
                ContextValue::Meta(v) => v.clone(),
            };
            map.insert(key.clone(), v);
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(key: &str, n: usize) -> PipelineContext {
        let mut ctx = PipelineContext::new();
        ctx.set_block(key, (0..n).map(|i| Record::new(format!("u{i}"))).collect());
        ctx
    }

    #[test]
    fn merge_overwrites_same_named_keys() {
        let base = ctx_with("events", 2);
        let patch = ctx_with("events", 1);
        let merged = merge_output("extract", StageOutput::Merge { context: base, patch });
        assert_eq!(merged.block("events").unwrap().len(), 1);
    }

    #[test]
    fn merge_keeps_untouched_keys() {
        let mut base = ctx_with("events", 2);
        base.set_meta("source_url", json!("https://example.org"));
        let patch = ctx_with("news", 3);
        let merged = merge_output("extract", StageOutput::Merge { context: base, patch });
        assert_eq!(merged.block("events").unwrap().len(), 2);
        assert_eq!(merged.block("news").unwrap().len(), 3);
        assert_eq!(merged.source_url(), Some("https://example.org"));
    }

    #[test]
    fn non_mapping_results_land_under_stage_key() {
        let merged = merge_output(
            "summarize",
            StageOutput::Value { context: ctx_with("events", 1), value: json!({"a": 1}) },
        );
        assert_eq!(merged.meta("summarize"), Some(&json!({"a": 1})));
        assert_eq!(merged.record_count(), 1);
    }

    #[test]
    fn replace_discards_previous_state() {
        let replacement = ctx_with("other", 1);
        let merged = merge_output("x", StageOutput::Replace(replacement.clone()));
        assert_eq!(merged, replacement);
    }

    #[test]
    fn take_block_keeps_slot_order() {
        let mut ctx = ctx_with("a", 1);
        ctx.set_block("b", vec![]);
        let taken = ctx.take_block("a").unwrap();
        ctx.set_block("a", taken);
        assert_eq!(ctx.block_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
