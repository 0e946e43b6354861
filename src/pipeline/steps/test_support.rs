//! In-process fakes shared by the stage unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::app::ports::{HttpClientPort, HttpError, HttpRequest, HttpResponse};

pub type Reply = Result<HttpResponse, HttpError>;

pub fn ok(body: impl Into<Vec<u8>>) -> Reply {
    Ok(HttpResponse {
        status: 200,
        bytes: body.into(),
        content_type: "text/html".to_string(),
        final_url: String::new(),
    })
}

pub fn status(code: u16) -> Reply {
    Ok(HttpResponse {
        status: code,
        bytes: Vec::new(),
        content_type: "text/plain".to_string(),
        final_url: String::new(),
    })
}

/// Replies per URL in order; the last reply repeats. Unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedHttp {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, url: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// (url, verify_tls) for every call, in order.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|(u, _)| u == url).count()
    }
}

#[async_trait]
impl HttpClientPort for ScriptedHttp {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.url.clone(), request.verify_tls));
        let mut replies = self.replies.lock().unwrap();
        let Some(queue) = replies.get_mut(&request.url) else {
            return status(404);
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        let mut reply = reply.unwrap_or_else(|| status(404))?;
        if reply.final_url.is_empty() {
            reply.final_url = request.url.clone();
        }
        Ok(reply)
    }
}
