use crate::app::ports::{HttpClientPort, HttpError, HttpRequest, HttpResponse};
use crate::constants::DOWNLOAD_CHUNK_SIZE;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::error::Error as _;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("sourcewatch/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed client. Keeps one verifying and one non-verifying client so the
/// TLS fallback does not rebuild connection pools.
pub struct ReqwestHttp {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self, HttpError> {
        let verified = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HttpError::Other(e.to_string()))?;
        let insecure = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| HttpError::Other(e.to_string()))?;
        Ok(Self { verified, insecure })
    }
}

fn header_map(request: &HttpRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in &request.headers {
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid header {}", k),
        }
    }
    headers
}

const TLS_MARKERS: [&str; 4] = ["certificate", "tls", "ssl", "handshake"];

/// True when a message from below reqwest names a TLS failure. reqwest's own
/// message carries the request URL and is never passed here.
fn is_tls_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TLS_MARKERS.iter().any(|m| lower.contains(m))
}

/// Map reqwest failures onto the port's taxonomy; TLS problems are found in the source chain.
fn classify(e: reqwest::Error) -> HttpError {
    let mut chain = e.to_string();
    let mut tls = false;
    let mut source = e.source();
    while let Some(s) = source {
        let message = s.to_string();
        tls |= is_tls_message(&message);
        chain.push_str(": ");
        chain.push_str(&message);
        source = s.source();
    }
    if e.is_timeout() {
        HttpError::Timeout(chain)
    } else if tls && (e.is_connect() || e.is_request()) {
        HttpError::Tls(chain)
    } else if e.is_connect() {
        HttpError::Connect(chain)
    } else if e.is_body() || e.is_decode() {
        HttpError::Body(chain)
    } else {
        HttpError::Other(chain)
    }
}

/// Regroups hyper's frames, which arrive in sizes of its choosing, into fixed-size
/// chunks so the body grows one chunk at a time.
struct ChunkedBody {
    chunk_size: usize,
    bytes: Vec<u8>,
    pending: Vec<u8>,
    chunks: usize,
}

impl ChunkedBody {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            bytes: Vec::new(),
            pending: Vec::with_capacity(chunk_size),
            chunks: 0,
        }
    }

    fn push(&mut self, mut frame: &[u8]) {
        while !frame.is_empty() {
            let take = (self.chunk_size - self.pending.len()).min(frame.len());
            self.pending.extend_from_slice(&frame[..take]);
            frame = &frame[take..];
            if self.pending.len() == self.chunk_size {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.bytes.reserve(self.pending.len());
            self.bytes.append(&mut self.pending);
            self.chunks += 1;
        }
    }

    /// The whole body and the number of chunks it was read in.
    fn finish(mut self) -> (Vec<u8>, usize) {
        self.flush();
        (self.bytes, self.chunks)
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let client = if request.verify_tls {
            &self.verified
        } else {
            &self.insecure
        };
        let mut resp = client
            .get(&request.url)
            .headers(header_map(request))
            .timeout(request.timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body = ChunkedBody::new(DOWNLOAD_CHUNK_SIZE);
        while let Some(frame) = resp.chunk().await.map_err(classify)? {
            body.push(&frame);
        }
        let (bytes, chunks) = body.finish();
        debug!(url = %request.url, status, bytes = bytes.len(), chunks, "GET complete");

        Ok(HttpResponse {
            status,
            bytes,
            content_type,
            final_url,
        })
    }
}
