use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::processing::template::TemplateError;

// Outbound HTTP
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub timeout: Duration,
    pub verify_tls: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: IndexMap::new(),
            timeout: Duration::from_secs(crate::constants::DEFAULT_FETCH_TIMEOUT_SECS),
            verify_tls: true,
        }
    }

    pub fn with_headers(mut self, headers: &IndexMap<String, String>) -> Self {
        self.headers = headers.clone();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// URL after redirects.
    pub final_url: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    #[error("TLS verification failed: {0}")]
    Tls(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Failed reading body: {0}")]
    Body(String),

    #[error("Request failed: {0}")]
    Other(String),
}

impl HttpError {
    pub fn is_tls(&self) -> bool {
        matches!(self, HttpError::Tls(_))
    }
}

#[async_trait]
pub trait HttpClientPort: Send + Sync {
    /// Issue a GET. Non-2xx statuses are returned as responses, not errors.
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

// PDF to text
pub trait PdfTextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], max_pages: usize) -> anyhow::Result<String>;
}

// Summarization backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

// Alert rendering
pub trait AlertRenderer: Send + Sync {
    fn render(
        &self,
        name: &str,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<String, TemplateError>;
}
