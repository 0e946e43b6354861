#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sourcewatch::app::ports::{HttpClientPort, HttpError, HttpRequest, HttpResponse, PdfTextExtractor};
use sourcewatch::pipeline::processing::transforms::LinkResolver;

/// Canned responses per URL. Every call is recorded; unknown URLs get a 404.
#[derive(Default)]
pub struct FakeHttp {
    routes: HashMap<String, Result<HttpResponse, HttpError>>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.reply(
            url,
            Ok(HttpResponse {
                status: 200,
                bytes: body.into(),
                content_type: content_type.to_string(),
                final_url: url.to_string(),
            }),
        )
    }

    pub fn status(self, url: &str, status: u16) -> Self {
        self.reply(
            url,
            Ok(HttpResponse {
                status,
                bytes: Vec::new(),
                content_type: "text/plain".to_string(),
                final_url: url.to_string(),
            }),
        )
    }

    pub fn reply(mut self, url: &str, reply: Result<HttpResponse, HttpError>) -> Self {
        self.routes.insert(url.to_string(), reply);
        self
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(u, _)| u == url).count()
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClientPort for FakeHttp {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.url.clone(), request.verify_tls));
        match self.routes.get(&request.url) {
            Some(reply) => reply.clone(),
            None => Ok(HttpResponse {
                status: 404,
                bytes: Vec::new(),
                content_type: "text/plain".to_string(),
                final_url: request.url.clone(),
            }),
        }
    }
}

/// Resolves any link to a numbered direct URL and counts how often it ran.
#[derive(Clone, Default)]
pub struct CountingResolver {
    pub calls: Arc<AtomicUsize>,
}

impl CountingResolver {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkResolver for CountingResolver {
    fn name(&self) -> &'static str {
        "yandex_disk"
    }

    async fn resolve(&self, _template: &str, input: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = input.rsplit('/').next().unwrap_or_default();
        Ok(format!("https://downloader.disk.yandex.ru/{id}.pdf"))
    }
}

/// Bytes after `%PDF-` are the text.
pub struct FakePdf;

impl PdfTextExtractor for FakePdf {
    fn extract(&self, bytes: &[u8], _max_pages: usize) -> anyhow::Result<String> {
        Ok(String::from_utf8_lossy(bytes.strip_prefix(b"%PDF-").unwrap_or(bytes)).into_owned())
    }
}
