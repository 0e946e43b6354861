use async_trait::async_trait;
use roxmltree::{Document, Node, NodeId, ParsingOptions};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::field_rules::{build_record, finalize_markup_records, normalize_ws, CompiledBlock, CompiledField};
use super::PipelineStage;
use crate::config::{FieldRule, ELEMENT_TEXT_MARKER};
use crate::domain::{PipelineContext, Record, SourceDocument, StageOutput};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::transforms::{strip_query, TransformContext, UrlResolver};

/// Raw field values per matched element, in field order. `None` is a missing value.
type RawItems = Vec<Vec<Option<String>>>;

/// Selector-based extraction for HTML (CSS selectors) and XML/RSS (tag-name chains).
pub struct MarkupExtractStage {
    template_name: String,
    blocks: Vec<CompiledBlock>,
    urls: Arc<UrlResolver>,
}

impl MarkupExtractStage {
    pub fn new(template_name: impl Into<String>, blocks: Vec<CompiledBlock>, urls: Arc<UrlResolver>) -> Self {
        Self {
            template_name: template_name.into(),
            blocks,
            urls,
        }
    }

    async fn build_block(&self, block: &CompiledBlock, items: RawItems, source_url: &str) -> Vec<Record> {
        let base = strip_query(source_url);
        let tctx = TransformContext {
            template: &self.template_name,
            base_url: &base,
        };
        let mut records = Vec::with_capacity(items.len());
        for raws in items {
            let raws = raws
                .into_iter()
                .map(|v| Value::String(v.unwrap_or_default()))
                .collect();
            let (record, _) = build_record(&block.fields, raws, &tctx, &self.urls).await;
            records.push(record);
        }
        finalize_markup_records(records, source_url)
    }
}

#[async_trait]
impl PipelineStage for MarkupExtractStage {
    async fn run(&self, ctx: PipelineContext) -> Result<StageOutput> {
        let source_url = ctx.source_url().unwrap_or_default().to_string();
        // Parsed documents are not Send; pull raw values out before any await.
        let raw_blocks: Vec<RawItems> = match ctx.document() {
            Some(SourceDocument::Html(body)) => html_raw_blocks(body, &self.blocks),
            Some(SourceDocument::Xml(body)) => xml_raw_blocks(body, &self.blocks),
            Some(other) => {
                return Err(PipelineError::Stage {
                    stage: "extract",
                    message: format!("expected a markup document, got {}", other.kind()),
                })
            }
            None => {
                warn!("No document in context; nothing to extract");
                vec![Vec::new(); self.blocks.len()]
            }
        };

        let mut patch = PipelineContext::new();
        for (block, items) in self.blocks.iter().zip(raw_blocks) {
            let matched = items.len();
            let records = self.build_block(block, items, &source_url).await;
            info!("Block '{}': {} elements matched, {} records kept", block.name, matched, records.len());
            patch.set_block(block.name.clone(), records);
        }
        Ok(StageOutput::Merge { context: ctx, patch })
    }

    fn name(&self) -> &'static str {
        "extract"
    }
}

fn html_raw_blocks(body: &str, blocks: &[CompiledBlock]) -> Vec<RawItems> {
    let document = Html::parse_document(body);
    blocks
        .iter()
        .map(|block| {
            let selector = match Selector::parse(&block.selector) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Block '{}': invalid selector '{}': {:?}", block.name, block.selector, e);
                    return Vec::new();
                }
            };
            document
                .select(&selector)
                .take(block.limit.unwrap_or(usize::MAX))
                .map(|el| block.fields.iter().map(|f| html_field(el, f)).collect())
                .collect()
        })
        .collect()
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<String>())
}

fn html_field(el: ElementRef<'_>, field: &CompiledField) -> Option<String> {
    match &field.rule {
        FieldRule::Shorthand(s) if s == ELEMENT_TEXT_MARKER => Some(element_text(el)),
        FieldRule::Shorthand(attr) => el.value().attr(attr).map(|v| v.trim().to_string()),
        FieldRule::Structured(spec) => {
            let target = match &spec.selector {
                Some(sel) => match Selector::parse(sel) {
                    Ok(sub) => el.select(&sub).next()?,
                    Err(e) => {
                        debug!("Field '{}': invalid selector '{}': {:?}", field.name, sel, e);
                        return None;
                    }
                },
                None => el,
            };
            match spec.attr.as_deref() {
                Some(attr) if attr != ELEMENT_TEXT_MARKER => {
                    target.value().attr(attr).map(|v| v.trim().to_string())
                }
                _ => Some(element_text(target)),
            }
        }
    }
}

fn xml_raw_blocks(body: &str, blocks: &[CompiledBlock]) -> Vec<RawItems> {
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let document = match Document::parse_with_options(body, options) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("Source XML could not be parsed: {}", e);
            return vec![Vec::new(); blocks.len()];
        }
    };
    blocks
        .iter()
        .map(|block| {
            select_xml(&document, &block.selector)
                .into_iter()
                .take(block.limit.unwrap_or(usize::MAX))
                .map(|node| block.fields.iter().map(|f| xml_field(node, f)).collect())
                .collect()
        })
        .collect()
}

/// Whitespace-separated descendant chain of local tag names, e.g. `channel item`.
fn select_xml<'a, 'input>(document: &'a Document<'input>, selector: &str) -> Vec<Node<'a, 'input>> {
    let mut current = vec![document.root()];
    for name in selector.split_whitespace() {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut next = Vec::new();
        for node in &current {
            for d in node.descendants().skip(1) {
                if d.is_element() && d.tag_name().name() == name && seen.insert(d.id()) {
                    next.push(d);
                }
            }
        }
        next.sort_by_key(|n| n.range().start);
        current = next;
    }
    current
}

fn xml_text(node: Node<'_, '_>) -> String {
    let raw: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    normalize_ws(&raw)
}

/// Child element text first, then an attribute of the same name.
fn xml_lookup(node: Node<'_, '_>, name: &str) -> Option<String> {
    if let Some(child) = node
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
    {
        return Some(xml_text(child));
    }
    node.attributes()
        .find(|a| a.name() == name)
        .map(|a| a.value().trim().to_string())
}

fn xml_field(node: Node<'_, '_>, field: &CompiledField) -> Option<String> {
    match &field.rule {
        FieldRule::Shorthand(s) if s == ELEMENT_TEXT_MARKER => Some(xml_text(node)),
        FieldRule::Shorthand(name) => xml_lookup(node, name),
        FieldRule::Structured(spec) => {
            let target = match &spec.selector {
                Some(sel) => *select_in(node, sel).first()?,
                None => node,
            };
            match spec.attr.as_deref() {
                Some(attr) if attr != ELEMENT_TEXT_MARKER => xml_lookup(target, attr),
                _ => Some(xml_text(target)),
            }
        }
    }
}

fn select_in<'a, 'input>(node: Node<'a, 'input>, selector: &str) -> Vec<Node<'a, 'input>> {
    let mut current = vec![node];
    for name in selector.split_whitespace() {
        current = current
            .iter()
            .flat_map(|n| n.descendants().skip(1))
            .filter(|d| d.is_element() && d.tag_name().name() == name)
            .collect();
    }
    current
}
