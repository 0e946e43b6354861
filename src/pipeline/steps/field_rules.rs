//! Field rules compiled once per run and applied per extracted item.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{ExtractBlockConfig, FieldRule, FieldSpec};
use crate::domain::{value_to_string, Record};
use crate::error::ConfigError;
use crate::pipeline::processing::template::render_transform;
use crate::pipeline::processing::transforms::{
    resolve_relative, strip_query, NamedTransform, TransformContext, TransformRegistry, UrlResolver,
};

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,
    pub rule: FieldRule,
    pub named: Option<NamedTransform>,
}

impl CompiledField {
    pub fn spec(&self) -> Option<&FieldSpec> {
        match &self.rule {
            FieldRule::Structured(spec) => Some(spec),
            FieldRule::Shorthand(_) => None,
        }
    }

    fn template(&self) -> Option<&str> {
        self.spec().and_then(|s| s.transform.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub name: String,
    pub selector: String,
    pub limit: Option<usize>,
    pub fields: Vec<CompiledField>,
}

/// Resolve every `transform_type` up front; an unknown name is a configuration error.
pub fn compile_blocks(
    blocks: &IndexMap<String, ExtractBlockConfig>,
    registry: &TransformRegistry,
) -> Result<Vec<CompiledBlock>, ConfigError> {
    blocks
        .iter()
        .map(|(name, block)| -> Result<CompiledBlock, ConfigError> {
            let fields = block
                .fields
                .iter()
                .map(|(field, rule)| -> Result<CompiledField, ConfigError> {
                    let named = match rule {
                        FieldRule::Structured(FieldSpec {
                            transform_type: Some(t),
                            ..
                        }) => Some(registry.resolve(t).map_err(|e| ConfigError::Invalid {
                            field: format!("extract.{name}.fields.{field}"),
                            message: e.to_string(),
                        })?),
                        _ => None,
                    };
                    Ok(CompiledField {
                        name: field.clone(),
                        rule: rule.clone(),
                        named,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            Ok(CompiledBlock {
                name: name.clone(),
                selector: block.selector.clone(),
                limit: block.limit,
                fields,
            })
        })
        .collect()
}

/// Template transform over `{value, ...siblings}`, then the named transform.
/// Failures leave an empty value for the field.
pub async fn finish_field(
    field: &CompiledField,
    raw: Value,
    siblings: &Map<String, Value>,
    tctx: &TransformContext<'_>,
    urls: &UrlResolver,
) -> Value {
    let mut value = raw;
    if let Some(template) = field.template() {
        let mut scope = siblings.clone();
        scope.insert("value".to_string(), value.clone());
        value = match render_transform(template, &Value::Object(scope)) {
            Ok(v) => v,
            Err(e) => {
                warn!(field = %field.name, "transform template failed: {}", e);
                Value::String(String::new())
            }
        };
    }
    if let Some(named) = &field.named {
        let input = value_to_string(&value);
        value = Value::String(named.apply(&input, tctx, urls).await);
    }
    value
}

/// Build one record from per-field raw values given in field order.
pub async fn build_record(
    fields: &[CompiledField],
    raws: Vec<Value>,
    tctx: &TransformContext<'_>,
    urls: &UrlResolver,
) -> (Record, Map<String, Value>) {
    let mut record = Record::default();
    let mut siblings = Map::new();
    for (field, raw) in fields.iter().zip(raws) {
        let value = finish_field(field, raw, &siblings, tctx, urls).await;
        record.set_field(&field.name, value.clone());
        siblings.insert(field.name.clone(), value);
    }
    (record, siblings)
}

/// Markup post-pass: `url_final` against the source base, drop untitled records and
/// repeated `url_final` values. Order is kept.
pub fn finalize_markup_records(records: Vec<Record>, source_url: &str) -> Vec<Record> {
    let base = strip_query(source_url);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for mut record in records {
        if !record.has_title() {
            continue;
        }
        let link = record.url.trim();
        if !link.is_empty() {
            let resolved = resolve_relative(link, &base);
            if !seen.insert(resolved.clone()) {
                continue;
            }
            record.url_final = Some(resolved);
        }
        out.push(record);
    }
    out
}

pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titled(url: &str, title: &str) -> Record {
        let mut r = Record::new(url);
        r.title = Some(title.to_string());
        r
    }

    #[test]
    fn finalize_drops_untitled_and_repeats() {
        let records = vec![
            titled("/a", "A"),
            titled("/b", ""),
            titled("https://example.org/a", "A again"),
            titled("c", "C"),
        ];
        let out = finalize_markup_records(records, "https://example.org/list/?page=2");
        let finals: Vec<_> = out.iter().map(|r| r.url_final.clone().unwrap()).collect();
        assert_eq!(finals, vec!["https://example.org/a", "https://example.org/list/c"]);
    }

    #[test]
    fn unknown_named_transform_is_config_error() {
        let toml = r#"
            selector = ".item"
            [fields]
            title = "self"
            url = { attr = "href", transform_type = "nope" }
        "#;
        let block: ExtractBlockConfig = toml::from_str(toml).unwrap();
        let mut blocks = IndexMap::new();
        blocks.insert("events".to_string(), block);
        let err = compile_blocks(&blocks, &TransformRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
