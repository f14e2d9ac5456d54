//! Concurrent External Fetcher: parallel, failure-isolated retrieval of job pages.
//!
//! Each identifier is fetched on its own future inside a bounded sub-pool; one
//! failure never cancels or delays the others. Page text is cached per
//! canonical identifier when scraper caching is enabled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Fingerprint, ResponseCache};
use crate::errors::{ErrorKind, TaskError};

pub mod extract;
pub mod reference;

pub use reference::ResourceId;

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    /// Base of the job-source site; posting ids are fetched beneath it.
    pub base_url: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_chars: usize,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.linkedin.com".to_string(),
            concurrency: 8,
            timeout: Duration::from_secs(120),
            max_chars: 10_000,
        }
    }
}

/// Extracted text of one fetched resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub source_url: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("{0} was not found")]
    NotFound(String),

    #[error("transient failure fetching {url}: {message}")]
    Transient { url: String, message: String },

    #[error("{url} rejected the request with status {status}")]
    Rejected { url: String, status: u16 },

    #[error("timed out after {timeout:?} fetching {url}")]
    Timeout { url: String, timeout: Duration },

    #[error("{0} contained no extractable text")]
    Empty(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::NotFound(_) => ErrorKind::InvalidReference,
            FetchError::Transient { .. } | FetchError::Timeout { .. } => {
                ErrorKind::TransientExternal
            }
            FetchError::Rejected { .. } | FetchError::Empty(_) => ErrorKind::ExternalRejected,
        }
    }
}

impl From<FetchError> for TaskError {
    fn from(e: FetchError) -> Self {
        TaskError::new(e.kind(), e.to_string())
    }
}

/// Raw markup retrieval. The HTTP implementation is swapped for a stub in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) resumeflow")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let transient = |e: reqwest::Error| FetchError::Transient {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transient)?;
        let status = response.status();
        match status {
            s if s.is_success() => response.text().await.map_err(transient),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(FetchError::NotFound(url.to_string())),
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                Err(FetchError::Transient {
                    url: url.to_string(),
                    message: format!("status {s}"),
                })
            }
            s => Err(FetchError::Rejected {
                url: url.to_string(),
                status: s.as_u16(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    settings: FetcherSettings,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, cache: ResponseCache, settings: FetcherSettings) -> Self {
        Self {
            transport,
            cache,
            settings,
        }
    }

    /// Fetches every identifier concurrently, at most `concurrency` at a time.
    /// The result holds exactly one entry per distinct identifier.
    pub async fn fetch_all(
        &self,
        ids: &[ResourceId],
    ) -> HashMap<ResourceId, Result<Payload, FetchError>> {
        let mut distinct: Vec<ResourceId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !distinct.contains(id) {
                distinct.push(id.clone());
            }
        }

        stream::iter(distinct)
            .map(move |id| async move {
                let result = self.fetch_one(&id).await;
                (id, result)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    async fn fetch_one(&self, id: &ResourceId) -> Result<Payload, FetchError> {
        let cache_settings = self.cache.settings();
        if !cache_settings.scraper_enabled {
            return self.fetch_uncached(id).await;
        }
        let fingerprint = Fingerprint::for_fetch(id);
        let ttl = cache_settings.scraper_ttl;
        self.cache
            .get_or_compute(&fingerprint, ttl, || self.fetch_uncached(id))
            .await
    }

    async fn fetch_uncached(&self, id: &ResourceId) -> Result<Payload, FetchError> {
        let url = id.fetch_url(&self.settings.base_url);
        debug!(%id, %url, "fetching job source");

        let markup = tokio::time::timeout(self.settings.timeout, self.transport.get(&url))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.clone(),
                timeout: self.settings.timeout,
            })??;

        let text = extract::extract_relevant_text(&markup, self.settings.max_chars);
        if text.is_empty() {
            warn!(%id, "fetched page had no extractable text");
            return Err(FetchError::Empty(url));
        }
        Ok(Payload {
            source_url: url,
            text,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned markup per URL after an optional delay.
    #[derive(Default)]
    pub(crate) struct StubTransport {
        pages: Mutex<HashMap<String, Result<String, FetchError>>>,
        pub(crate) delay: Duration,
        pub(crate) calls: AtomicUsize,
    }

    impl StubTransport {
        pub(crate) fn with_page(self, url: &str, page: Result<String, FetchError>) -> Self {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), page);
            self
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn get(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::NotFound(url.to_string())))
        }
    }

    fn fetcher(transport: Arc<StubTransport>, cache_enabled: bool) -> Fetcher {
        let cache = ResponseCache::new(
            Arc::new(MemoryStore::new()),
            CacheSettings {
                scraper_enabled: cache_enabled,
                ..CacheSettings::default()
            },
        );
        Fetcher::new(
            transport,
            cache,
            FetcherSettings {
                base_url: "https://jobs.test".to_string(),
                timeout: Duration::from_secs(5),
                ..FetcherSettings::default()
            },
        )
    }

    fn posting(id: &str) -> ResourceId {
        ResourceId::Posting(id.to_string())
    }

    fn page_url(id: &str) -> String {
        format!("https://jobs.test/jobs-guest/jobs/api/jobPosting/{id}")
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let transport = Arc::new(
            StubTransport::default()
                .with_page(&page_url("1"), Ok("<p>Rust engineer</p>".into()))
                .with_page(
                    &page_url("2"),
                    Err(FetchError::Transient {
                        url: page_url("2"),
                        message: "connection reset".into(),
                    }),
                )
                .with_page(&page_url("3"), Ok("<p>Go engineer</p>".into())),
        );
        let results = fetcher(transport, false)
            .fetch_all(&[posting("1"), posting("2"), posting("3"), posting("4")])
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[&posting("1")].as_ref().unwrap().text, "Rust engineer");
        assert_eq!(results[&posting("3")].as_ref().unwrap().text, "Go engineer");
        assert_eq!(
            results[&posting("2")].as_ref().unwrap_err().kind(),
            ErrorKind::TransientExternal
        );
        assert_eq!(
            results[&posting("4")].as_ref().unwrap_err().kind(),
            ErrorKind::InvalidReference
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_run_concurrently() {
        let mut transport = StubTransport::default();
        transport.delay = Duration::from_secs(1);
        let transport = Arc::new(
            transport
                .with_page(&page_url("1"), Ok("<p>a</p>".into()))
                .with_page(&page_url("2"), Ok("<p>b</p>".into()))
                .with_page(&page_url("3"), Ok("<p>c</p>".into())),
        );

        let started = tokio::time::Instant::now();
        let results = fetcher(transport, false)
            .fetch_all(&[posting("1"), posting("2"), posting("3")])
            .await;

        assert!(results.values().all(Result::is_ok));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_as_transient() {
        let mut transport = StubTransport::default();
        transport.delay = Duration::from_secs(30);
        let transport = Arc::new(transport.with_page(&page_url("1"), Ok("<p>late</p>".into())));

        let results = fetcher(transport, false).fetch_all(&[posting("1")]).await;
        let err = results[&posting("1")].as_ref().unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::TransientExternal);
    }

    #[tokio::test]
    async fn test_cached_page_is_not_refetched() {
        let transport = Arc::new(
            StubTransport::default().with_page(&page_url("1"), Ok("<p>Rust engineer</p>".into())),
        );
        let fetcher = fetcher(transport.clone(), true);

        fetcher.fetch_all(&[posting("1")]).await;
        let second = fetcher.fetch_all(&[posting("1"), posting("1")]).await;

        assert_eq!(second.len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_postings_and_pages_are_fetched_once() {
        let page = ResourceId::resolve("https://careers.example.com/jobs/7#apply").unwrap();
        let transport = Arc::new(
            StubTransport::default()
                .with_page(&page_url("1"), Ok("<p>Rust engineer</p>".into()))
                .with_page("https://careers.example.com/jobs/7", Ok("<p>SRE</p>".into())),
        );
        let same_page = ResourceId::resolve("https://careers.example.com/jobs/7").unwrap();
        let results = fetcher(transport.clone(), false)
            .fetch_all(&[posting("1"), page.clone(), posting("1"), same_page])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[&page].as_ref().unwrap().text, "SRE");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    /// `fetch_all` must be callable from `async_trait` methods, which need a `Send` future.
    #[test]
    fn test_fetch_all_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let fetcher = fetcher(Arc::new(StubTransport::default()), true);
        let ids = [posting("1")];
        assert_send(&fetcher.fetch_all(&ids));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let transport = Arc::new(StubTransport::default());
        let fetcher = fetcher(transport.clone(), true);

        fetcher.fetch_all(&[posting("9")]).await;
        fetcher.fetch_all(&[posting("9")]).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_page_is_rejected() {
        let transport =
            Arc::new(StubTransport::default().with_page(&page_url("1"), Ok("<html></html>".into())));
        let results = fetcher(transport, false).fetch_all(&[posting("1")]).await;
        assert!(matches!(
            results[&posting("1")],
            Err(FetchError::Empty(_))
        ));
    }
}
