//! Feed transport.
//!
//! [`Fetcher`] is the seam between the source runner and the network, so
//! tests can serve canned feeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("taskflow/", env!("CARGO_PKG_VERSION"));

/// Everything needed to fetch one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_id: String,
    /// Normalized `http(s)://` or `file://` URL.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Validators from the last successful fetch.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    Body {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// The server confirmed the cached copy is current.
    NotModified,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// `reqwest` client for `http(s)://`; reads `file://` URLs from disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        if let Some(path) = request.url.strip_prefix("file://") {
            let body = tokio::fs::read_to_string(path).await?;
            return Ok(FetchResponse::Body {
                body,
                etag: None,
                last_modified: None,
            });
        }

        let mut builder = self
            .client
            .get(&request.url)
            .header("Accept", "text/calendar, */*;q=0.5");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(username) = request.username.as_deref() {
            builder = builder.basic_auth(username, request.password.as_deref());
        }
        if let Some(etag) = request.etag.as_deref() {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = request.last_modified.as_deref() {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        debug!(source = %request.source_id, %status, "calendar fetch response");
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::NotModified);
        }
        if !status.is_success() {
            return Err(Error::Fetch {
                source_id: request.source_id.clone(),
                message: format!("HTTP {status}"),
            });
        }

        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let body = resp.text().await?;
        Ok(FetchResponse::Body {
            body,
            etag,
            last_modified,
        })
    }
}

/// What a [`StaticFetcher`] answers for one URL.
#[derive(Debug, Clone)]
pub enum StaticReply {
    Body(String),
    NotModified,
    Fail(String),
    /// Sleep before answering with the body; used to exercise timeouts.
    Delay(Duration, String),
}

/// In-memory fetcher keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    replies: Arc<Mutex<HashMap<String, StaticReply>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: impl Into<String>, reply: StaticReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), reply);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.url)
            .cloned();
        let fail = |message: String| Error::Fetch {
            source_id: request.source_id.clone(),
            message,
        };
        match reply {
            Some(StaticReply::Body(body)) => Ok(FetchResponse::Body {
                body,
                etag: None,
                last_modified: None,
            }),
            Some(StaticReply::NotModified) => Ok(FetchResponse::NotModified),
            Some(StaticReply::Fail(message)) => Err(fail(message)),
            Some(StaticReply::Delay(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(FetchResponse::Body {
                    body,
                    etag: None,
                    last_modified: None,
                })
            }
            None => Err(fail(format!("no reply registered for {}", request.url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.ics");
        std::fs::write(&path, "BEGIN:VCALENDAR\nEND:VCALENDAR\n").expect("write");
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).expect("client");
        let request = FetchRequest {
            source_id: "local".to_string(),
            url: format!("file://{}", path.display()),
            ..FetchRequest::default()
        };
        match fetcher.fetch(&request).await.expect("fetch") {
            FetchResponse::Body { body, .. } => assert!(body.starts_with("BEGIN:VCALENDAR")),
            FetchResponse::NotModified => panic!("unexpected 304"),
        }
    }

    #[tokio::test]
    async fn static_fetcher_records_requests() {
        let fetcher = StaticFetcher::new();
        fetcher.set("https://example.com/a.ics", StaticReply::Fail("boom".to_string()));
        let request = FetchRequest {
            source_id: "a".to_string(),
            url: "https://example.com/a.ics".to_string(),
            ..FetchRequest::default()
        };
        let err = fetcher.fetch(&request).await.expect_err("failure");
        assert!(matches!(err, Error::Fetch { .. }));
        assert_eq!(fetcher.requests().len(), 1);
    }
}
