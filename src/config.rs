use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// One monitoring job, loaded once per run and shared read-only by every stage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub meta: IndexMap<String, serde_json::Value>,
    pub template_name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub extract: Option<IndexMap<String, ExtractBlockConfig>>,
    #[serde(default)]
    pub download: Option<DownloadConfig>,
    #[serde(default)]
    pub processing: Option<ProcessingConfig>,
    #[serde(default)]
    pub normalize: Option<NormalizeConfig>,
    #[serde(default, alias = "gpt")]
    pub summarize: Option<SummarizeConfig>,
    #[serde(default)]
    pub alert: Option<AlertConfig>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Html,
    #[serde(alias = "rss")]
    Xml,
    Json,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Html => "html",
            SourceType::Xml => "xml",
            SourceType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceType,
    /// May contain template expressions such as `{{ now | date("%Y-%m-%d") }}`.
    pub url: String,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default = "default_fetch_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// CSS selector used when enriching records with their page body.
    #[serde(default)]
    pub selector: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            headers: IndexMap::new(),
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            verify_ssl: true,
            selector: None,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractBlockConfig {
    pub selector: String,
    pub fields: IndexMap<String, FieldRule>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A field is either shorthand (`"self"`, an attribute name, or a JSON path)
/// or a structured rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldRule {
    Shorthand(String),
    Structured(FieldSpec),
}

pub const ELEMENT_TEXT_MARKER: &str = "self";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FieldSpec {
    /// Attribute name (markup) or path expression (JSON). Absent means element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Optional descendant selector evaluated inside the matched element.
    #[serde(default)]
    pub selector: Option<String>,
    /// Template rendered with `value` plus already extracted sibling fields.
    #[serde(default)]
    pub transform: Option<String>,
    /// Name of a registered transform function.
    #[serde(default)]
    pub transform_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_download_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub allow_html: bool,
    #[serde(default)]
    pub allow_json: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            allow_html: false,
            allow_json: false,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_extensions() -> Vec<String> {
    vec![".pdf".to_string(), ".docx".to_string()]
}

fn default_download_timeout() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub extract_keywords: Vec<String>,
    #[serde(default)]
    pub extract_patterns: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub fragment_max_chars: Option<usize>,
    #[serde(default)]
    pub text_max_chars: Option<usize>,
    #[serde(default)]
    pub chunk_head_chars: Option<usize>,
    #[serde(default)]
    pub chunk_tail_chars: Option<usize>,
    #[serde(default = "default_ocr_lang")]
    pub ocr_lang: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            extract_keywords: Vec::new(),
            extract_patterns: Vec::new(),
            max_pages: DEFAULT_MAX_PAGES,
            fragment_max_chars: None,
            text_max_chars: None,
            chunk_head_chars: None,
            chunk_tail_chars: None,
            ocr_lang: default_ocr_lang(),
        }
    }
}

impl ProcessingConfig {
    /// Resolved excerpt limits: explicit config, then environment, then defaults.
    pub fn limits(&self) -> ExcerptLimits {
        ExcerptLimits {
            fragment_max: self
                .fragment_max_chars
                .unwrap_or_else(|| env_usize(ENV_FRAGMENT_MAX, DEFAULT_FRAGMENT_MAX_CHARS)),
            text_max: self
                .text_max_chars
                .unwrap_or_else(|| env_usize(ENV_TEXT_MAX, DEFAULT_TEXT_MAX_CHARS)),
            head: self
                .chunk_head_chars
                .unwrap_or_else(|| env_usize(ENV_CHUNK_HEAD, DEFAULT_CHUNK_HEAD_CHARS)),
            tail: self
                .chunk_tail_chars
                .unwrap_or_else(|| env_usize(ENV_CHUNK_TAIL, DEFAULT_CHUNK_TAIL_CHARS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcerptLimits {
    pub fragment_max: usize,
    pub text_max: usize,
    pub head: usize,
    pub tail: usize,
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

fn default_ocr_lang() -> String {
    DEFAULT_OCR_LANG.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizeConfig {
    pub rules: Vec<NormalizeRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizeRule {
    /// Block the filters apply to.
    pub field: String,
    pub filters: Vec<FilterRule>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterRule {
    /// Keep only the first record for each value of this field.
    #[serde(default)]
    pub unique: Option<String>,
    /// Keep only records whose `text` matches this pattern.
    #[serde(default, alias = "pattern")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SummarizeConfig {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    pub templates: IndexMap<String, String>,
}

impl Config {
    /// Load a template from disk. `.json` files are parsed as JSON, everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml")
            .to_ascii_lowercase();
        let config = match ext.as_str() {
            "toml" => Self::from_toml_str(&content)?,
            "json" => Self::from_json_str(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.template_name.trim().is_empty() {
            return Err(ConfigError::MissingField("template_name".into()));
        }
        if self.source.url.trim().is_empty() {
            return Err(ConfigError::MissingField("source.url".into()));
        }

        if let Some(blocks) = &self.extract {
            for (name, block) in blocks {
                if block.selector.trim().is_empty() {
                    return Err(invalid(format!("extract.{name}.selector"), "selector is empty"));
                }
                if block.fields.is_empty() {
                    return Err(invalid(format!("extract.{name}.fields"), "no fields declared"));
                }
                if block.limit == Some(0) {
                    return Err(invalid(format!("extract.{name}.limit"), "limit must be positive"));
                }
            }
        }

        if let Some(download) = &self.download {
            if download.extensions.is_empty() {
                return Err(invalid("download.extensions", "at least one extension is required"));
            }
        }

        if let Some(processing) = &self.processing {
            for pattern in &processing.extract_patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    invalid("processing.extract_patterns", format!("'{pattern}': {e}"))
                })?;
            }
        }

        if let Some(normalize) = &self.normalize {
            for rule in &normalize.rules {
                for filter in &rule.filters {
                    if filter.unique.is_none() && filter.filter.is_none() {
                        return Err(invalid(
                            format!("normalize.{}", rule.field),
                            "filter declares neither `unique` nor `filter`",
                        ));
                    }
                    if let Some(pattern) = &filter.filter {
                        regex::Regex::new(pattern).map_err(|e| {
                            invalid(format!("normalize.{}", rule.field), format!("'{pattern}': {e}"))
                        })?;
                    }
                }
            }
        }

        if let Some(summarize) = &self.summarize {
            if summarize.prompt.trim().is_empty() {
                return Err(ConfigError::MissingField("summarize.prompt".into()));
            }
        }

        Ok(())
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        template_name = "tenders"

        [source]
        type = "html"
        url = "https://example.org/list"
    "#;

    #[test]
    fn minimal_template_gets_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.source.kind, SourceType::Html);
        assert_eq!(config.source.fetch.timeout_secs, 10);
        assert!(config.source.fetch.verify_ssl);
        assert!(config.extract.is_none());
        assert!(config.download.is_none());
    }

    #[test]
    fn rss_is_an_alias_for_xml() {
        let toml = MINIMAL.replace("\"html\"", "\"rss\"");
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.source.kind, SourceType::Xml);
    }

    #[test]
    fn field_rules_keep_declared_order_and_shapes() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            [extract.events]
            selector = ".item"
            limit = 5
            [extract.events.fields]
            title = "self"
            url = "href"
            date = { selector = ".date", transform = "{{ value | trim }}" }
            "#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        let block = &config.extract.as_ref().unwrap()["events"];
        let names: Vec<&str> = block.fields.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["title", "url", "date"]);
        assert!(matches!(&block.fields["title"], FieldRule::Shorthand(s) if s == "self"));
        match &block.fields["date"] {
            FieldRule::Structured(spec) => {
                assert_eq!(spec.selector.as_deref(), Some(".date"));
                assert!(spec.transform.is_some());
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn download_defaults_match_policy() {
        let toml = format!("{MINIMAL}\n[download]\nallow_html = true\n");
        let config = Config::from_toml_str(&toml).unwrap();
        let download = config.download.unwrap();
        assert_eq!(download.extensions, vec![".pdf", ".docx"]);
        assert_eq!(download.timeout_secs, 20);
        assert_eq!(download.retry_delay_ms, 2000);
        assert!(download.allow_html);
        assert!(!download.allow_json);
    }

    #[test]
    fn gpt_section_is_accepted_as_summarize() {
        let toml = format!("{MINIMAL}\n[gpt]\nprompt = \"Summarize {{{{ text }}}}\"\n");
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(config.summarize.is_some());
    }

    #[test]
    fn validation_rejects_empty_selector() {
        let toml = format!(
            "{MINIMAL}\n[extract.events]\nselector = \" \"\n[extract.events.fields]\ntitle = \"self\"\n"
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn validation_rejects_bad_normalize_pattern() {
        let toml = format!(
            "{MINIMAL}\n[[normalize.rules]]\nfield = \"events\"\nfilters = [{{ filter = \"(unclosed\" }}]\n"
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn json_templates_load_too() {
        let json = r#"{
            "template_name": "feed",
            "source": {"type": "json", "url": "https://api.example.org/items"},
            "extract": {"items": {"selector": "$.data[*]", "fields": {"title": "name"}}}
        }"#;
        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.source.kind, SourceType::Json);
    }

    #[test]
    fn missing_template_name_is_reported() {
        let toml = MINIMAL.replace("\"tenders\"", "\"\"");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "template_name"));
    }
}
