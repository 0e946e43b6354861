use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of the download and enrichment stages for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    Skipped,
    Failed,
    HtmlSuccess,
    HtmlEmpty,
    HtmlError,
    JsonSuccess,
    JsonEmpty,
    JsonInvalid,
    JsonError,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::Skipped => "skipped",
            DownloadStatus::Failed => "failed",
            DownloadStatus::HtmlSuccess => "html_success",
            DownloadStatus::HtmlEmpty => "html_empty",
            DownloadStatus::HtmlError => "html_error",
            DownloadStatus::JsonSuccess => "json_success",
            DownloadStatus::JsonEmpty => "json_empty",
            DownloadStatus::JsonInvalid => "json_invalid",
            DownloadStatus::JsonError => "json_error",
        }
    }
}

/// One extracted item. Well-known fields are typed; template-defined fields live in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_final: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_status: Option<DownloadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_error: Option<String>,
    /// Raw downloaded bytes. Never serialized and dropped by binary processing.
    #[serde(skip)]
    pub file_content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty", flatten)]
    pub extra: IndexMap<String, Value>,
}

/// Field names that map onto typed record fields rather than `extra`.
pub const RESERVED_FIELDS: &[&str] = &[
    "url",
    "url_final",
    "title",
    "text",
    "page_text",
    "excerpt",
    "gpt_text",
    "download_status",
    "download_error",
    "final_url",
    "error",
    "summary",
    "summary_error",
    "file_content",
];

impl Record {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// URL identifying the record: the resolved one when available.
    pub fn identity_url(&self) -> &str {
        match self.url_final.as_deref() {
            Some(u) if !u.is_empty() => u,
            _ => &self.url,
        }
    }

    pub fn has_title(&self) -> bool {
        self.title.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false)
    }

    /// Route an extracted value to its typed slot, or into `extra`.
    pub fn set_field(&mut self, name: &str, value: Value) {
        let text = || value_to_string(&value);
        let opt = || {
            let s = value_to_string(&value);
            if s.is_empty() && value.is_null() {
                None
            } else {
                Some(s)
            }
        };
        match name {
            "url" => self.url = text(),
            "url_final" => self.url_final = opt(),
            "title" => self.title = opt(),
            "text" => self.text = opt(),
            "page_text" => self.page_text = opt(),
            "excerpt" => self.excerpt = opt(),
            "gpt_text" => self.gpt_text = opt(),
            "final_url" => self.final_url = opt(),
            "error" => self.error = opt(),
            "download_error" => self.download_error = opt(),
            "summary_error" => self.summary_error = opt(),
            // Stage-owned fields cannot be set from a template.
            "download_status" | "summary" | "file_content" => {}
            _ => {
                self.extra.insert(name.to_string(), value);
            }
        }
    }

    /// String view of a field for filters, fingerprints and templates.
    pub fn field_str(&self, name: &str) -> Option<String> {
        match name {
            "url" => Some(self.url.clone()),
            "url_final" => self.url_final.clone(),
            "title" => self.title.clone(),
            "text" => self.text.clone(),
            "page_text" => self.page_text.clone(),
            "excerpt" => self.excerpt.clone(),
            "gpt_text" => self.gpt_text.clone(),
            "final_url" => self.final_url.clone(),
            "error" => self.error.clone(),
            "download_error" => self.download_error.clone(),
            "summary_error" => self.summary_error.clone(),
            "download_status" => self.download_status.map(|s| s.as_str().to_string()),
            _ => self.extra.get(name).map(value_to_string),
        }
    }

    /// Persisted status derived from the stage outcomes.
    pub fn status(&self) -> &'static str {
        if self.error.is_some() {
            return "error";
        }
        match self.download_status {
            Some(DownloadStatus::Skipped) => "skipped",
            Some(DownloadStatus::Failed) => "download_failed",
            Some(DownloadStatus::HtmlError) | Some(DownloadStatus::JsonError) => "fetch_error",
            Some(_) => "success",
            None => "pending",
        }
    }

    /// JSON view used by templates and previews. `file_content` is never included.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Scalar rendering used wherever a value must become text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_fields_go_to_typed_slots() {
        let mut r = Record::default();
        r.set_field("url", json!("/doc/1"));
        r.set_field("title", json!("Notice"));
        r.set_field("date", json!("2024-05-01"));
        assert_eq!(r.url, "/doc/1");
        assert_eq!(r.title.as_deref(), Some("Notice"));
        assert_eq!(r.extra.get("date"), Some(&json!("2024-05-01")));
    }

    #[test]
    fn identity_prefers_resolved_url() {
        let mut r = Record::new("/doc/1");
        assert_eq!(r.identity_url(), "/doc/1");
        r.url_final = Some("https://example.org/doc/1".into());
        assert_eq!(r.identity_url(), "https://example.org/doc/1");
    }

    #[test]
    fn file_content_is_not_serialized() {
        let mut r = Record::new("https://example.org/a.pdf");
        r.file_content = Some(vec![1, 2, 3]);
        r.extra.insert("price".into(), json!(12));
        let v = r.to_json();
        assert!(v.get("file_content").is_none());
        assert_eq!(v["price"], json!(12));
    }

    #[test]
    fn status_reflects_outcome() {
        let mut r = Record::new("u");
        assert_eq!(r.status(), "pending");
        r.download_status = Some(DownloadStatus::Success);
        assert_eq!(r.status(), "success");
        r.error = Some("boom".into());
        assert_eq!(r.status(), "error");
    }

    #[test]
    fn stage_owned_fields_ignore_template_values() {
        let mut r = Record::new("u");
        r.set_field("download_status", json!("success"));
        assert!(r.download_status.is_none());
        assert!(r.extra.is_empty());
    }
}
