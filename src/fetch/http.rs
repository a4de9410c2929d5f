// src/fetch/http.rs
//! HTTP transport seam. Production uses reqwest; tests script responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::FetchSettings;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`. Non-2xx statuses are errors. Bodies larger than
    /// `max_bytes` are rejected without being buffered whole.
    async fn get(&self, url: &str, max_bytes: usize) -> Result<HttpResponse, FetchError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(settings: &FetchSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout())
            .connect_timeout(Duration::from_secs(settings.timeout_secs.min(10)))
            .redirect(reqwest::redirect::Policy::limited(5))
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, max_bytes: usize) -> Result<HttpResponse, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::Http {
            status: None,
            message: format!("invalid url: {e}"),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::Http {
                status: None,
                message: format!("scheme {} is not fetched", parsed.scheme()),
            });
        }

        let mut resp = self.client.get(parsed).send().await.map_err(map_reqwest)?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(FetchError::Http {
                status: Some(status),
                message: resp.status().canonical_reason().unwrap_or("error").to_string(),
            });
        }
        if resp.content_length().is_some_and(|n| n as usize > max_bytes) {
            return Err(too_large(status, max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(map_reqwest)? {
            if body.len() + chunk.len() > max_bytes {
                return Err(too_large(status, max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(0)
    } else {
        FetchError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

fn too_large(status: u16, max_bytes: usize) -> FetchError {
    FetchError::Http {
        status: Some(status),
        message: format!("body exceeds {max_bytes} bytes"),
    }
}

/// Scripted reply for `MockHttpClient`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(Vec<u8>),
    Status(u16),
    /// Sleeps this long, then answers 200 with the body.
    Delay(Duration, Vec<u8>),
    /// Never answers; the caller's timeout fires.
    Hang,
}

/// In-process client with per-URL reply queues. The last queued reply of a URL
/// repeats once the queue is down to one element.
#[derive(Default)]
pub struct MockHttpClient {
    replies: Mutex<HashMap<String, VecDeque<MockReply>>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, reply: MockReply) -> Self {
        self.push(url, reply);
        self
    }

    pub fn push(&self, url: &str, reply: MockReply) {
        self.replies
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn next(&self, url: &str) -> Option<MockReply> {
        let mut replies = self.replies.lock();
        let queue = replies.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str, max_bytes: usize) -> Result<HttpResponse, FetchError> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let reply = self.next(url).unwrap_or(MockReply::Status(404));
        let body = match reply {
            MockReply::Ok(body) => body,
            MockReply::Status(code) => {
                return Err(FetchError::Http {
                    status: Some(code),
                    message: "scripted status".into(),
                })
            }
            MockReply::Delay(d, body) => {
                tokio::time::sleep(d).await;
                body
            }
            MockReply::Hang => {
                std::future::pending::<()>().await;
                Vec::new()
            }
        };
        if body.len() > max_bytes {
            return Err(too_large(200, max_bytes));
        }
        Ok(HttpResponse { status: 200, body })
    }
}
