//! Page fetching for the aggregation pipeline: one outbound GET per page, no retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use xtrobe_core::{PageRef, RawPage};

pub const CRATE_NAME: &str = "xtrobe-fetch";

/// Browser-like identity sent when no user agent is configured; some sources reject bare clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    /// Failure from a fetcher that does not speak HTTP (fixture or file backed).
    #[error("{0}")]
    Message(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

/// Fetch capability consumed by the pipeline. Implementations never panic on transport
/// problems; every failure comes back as a [`FetchError`].
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, page: &PageRef) -> Result<RawPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on in-flight requests across every caller sharing this fetcher.
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(user_agent)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_text(&self, url: &str) -> Result<(u16, String, String), FetchError> {
        // The limiter is never closed.
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Message(format!("fetch limiter: {e}")))?;

        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await.map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?;
        Ok((status.as_u16(), final_url, body))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, page: &PageRef) -> Result<RawPage, FetchError> {
        let span = info_span!(
            "page_fetch",
            source_id = %page.source_id,
            page = page.index,
            url = %page.url
        );
        async {
            let (status, final_url, body) = self.fetch_text(&page.url).await?;
            debug!(status, bytes = body.len(), "page fetched");
            Ok(RawPage {
                page: page.clone(),
                final_url,
                status,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "<html><body>hello</body></html>" }))
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "gone") }),
            )
            .route(
                "/ua",
                get(|headers: HeaderMap| async move {
                    headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn page(url: String) -> PageRef {
        PageRef::new("test-source", 1, url)
    }

    #[tokio::test]
    async fn successful_fetch_returns_body() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let raw = fetcher.fetch(&page(format!("{base}/ok"))).await.unwrap();
        assert_eq!(raw.status, 200);
        assert!(raw.body.contains("hello"));
        assert_eq!(raw.page.source_id, "test-source");
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch(&page(format!("{base}/missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn identifying_header_is_sent() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("xtrobe-test/1.0".into()),
            ..Default::default()
        })
        .unwrap();
        let raw = fetcher.fetch(&page(format!("{base}/ua"))).await.unwrap();
        assert_eq!(raw.body, "xtrobe-test/1.0");
    }

    #[tokio::test]
    async fn default_user_agent_is_browser_like() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let raw = fetcher.fetch(&page(format!("{base}/ua"))).await.unwrap();
        assert_eq!(raw.body, DEFAULT_USER_AGENT);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_request_error() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher
            .fetch(&page(format!("{base}/slow")))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn message_errors_are_never_timeouts() {
        let err = FetchError::Message("fixtures/missing.html: not found".into());
        assert_eq!(err.to_string(), "fixtures/missing.html: not found");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn connection_refused_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch(&page(format!("http://{addr}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }
}
