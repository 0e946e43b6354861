use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::PipelineStage;
use crate::config::{FilterRule, NormalizeConfig};
use crate::constants::KEY_NORMALIZE_STATS;
use crate::domain::{PipelineContext, Record, StageOutput};
use crate::error::{ConfigError, Result};

/// One compiled filter. A declared entry may carry both checks; uniqueness runs first.
#[derive(Debug, Clone)]
struct Filter {
    unique: Option<String>,
    pattern: Option<Regex>,
}

impl Filter {
    fn compile(block: &str, rule: &FilterRule) -> std::result::Result<Self, ConfigError> {
        let pattern = rule
            .filter
            .as_deref()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| ConfigError::Invalid {
                        field: format!("normalize.{block}.filter"),
                        message: e.to_string(),
                    })
            })
            .transpose()?;
        Ok(Self {
            unique: rule.unique.clone(),
            pattern,
        })
    }

    fn label(&self) -> String {
        match (&self.unique, &self.pattern) {
            (Some(f), Some(p)) => format!("unique:{f}+filter:{}", p.as_str()),
            (Some(f), None) => format!("unique:{f}"),
            (None, Some(p)) => format!("filter:{}", p.as_str()),
            (None, None) => "noop".to_string(),
        }
    }

    fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut records = records;
        if let Some(field) = &self.unique {
            let mut seen = HashSet::new();
            records.retain(|r| seen.insert(r.field_str(field).unwrap_or_default()));
        }
        if let Some(pattern) = &self.pattern {
            records.retain(|r| pattern.is_match(r.text.as_deref().unwrap_or_default()));
        }
        records
    }
}

#[derive(Debug, Clone)]
struct BlockRules {
    block: String,
    filters: Vec<Filter>,
}

/// Ordered per-block filter chains. Filtering removes records but never reorders them.
pub struct NormalizeStage {
    rules: Vec<BlockRules>,
}

impl NormalizeStage {
    pub fn new(config: &NormalizeConfig) -> std::result::Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| -> std::result::Result<BlockRules, ConfigError> {
                let filters = rule
                    .filters
                    .iter()
                    .map(|f| Filter::compile(&rule.field, f))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(BlockRules {
                    block: rule.field.clone(),
                    filters,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

#[async_trait]
impl PipelineStage for NormalizeStage {
    async fn run(&self, mut ctx: PipelineContext) -> Result<StageOutput> {
        let mut all_stats = Map::new();

        for rules in &self.rules {
            let Some(mut records) = ctx.take_block(&rules.block) else {
                warn!("Normalize: block '{}' not found in context", rules.block);
                all_stats.insert(
                    rules.block.clone(),
                    json!({ "initial": 0, "final": 0, "filters": [] }),
                );
                continue;
            };

            let initial = records.len();
            let mut per_filter = Vec::with_capacity(rules.filters.len());
            for filter in &rules.filters {
                let before = records.len();
                records = filter.apply(records);
                let removed = before - records.len();
                debug!("Normalize '{}': {} removed {}", rules.block, filter.label(), removed);
                per_filter.push(json!({ "filter": filter.label(), "removed": removed }));
            }

            info!("Normalize '{}': {} -> {} records", rules.block, initial, records.len());
            all_stats.insert(
                rules.block.clone(),
                json!({ "initial": initial, "final": records.len(), "filters": per_filter }),
            );
            ctx.set_block(rules.block.clone(), records);
        }

        ctx.set_meta(KEY_NORMALIZE_STATS, Value::Object(all_stats));
        Ok(StageOutput::Replace(ctx))
    }

    fn name(&self) -> &'static str {
        "normalize"
    }
}
