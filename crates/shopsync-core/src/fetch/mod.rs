//! Fetch orchestration on top of the response cache
//!
//! Three paths share one cache:
//! - single requests (`fetch`, `fetch_value`): cache first, errors propagate
//! - batches (`parallel_fetch`): per-item outcome, order preserved
//! - preloads (`preload`): fire-and-forget, failures only logged

pub mod rest;

pub use rest::RestBackend;

use crate::auth::Credential;
use crate::cache::{fingerprint, ResponseCache};
use crate::error::{SyncError, SyncResult};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A GET request against the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Path (or absolute URL) of the endpoint
    pub target: String,

    /// Query parameters, kept sorted
    pub params: BTreeMap<String, String>,

    /// Replaces the class TTL when caching this response
    pub ttl: Option<Duration>,

    /// Replaces the default request timeout
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: BTreeMap::new(),
            ttl: None,
            timeout: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cache key for this request
    pub fn cache_key(&self) -> String {
        fingerprint(&self.target, &self.params)
    }
}

/// Network seam: anything that can turn a request into a JSON document
pub trait Backend: Send + Sync + 'static {
    fn get_json(&self, request: &FetchRequest) -> impl Future<Output = SyncResult<Value>> + Send;

    /// Called when the signed-in identity changes
    fn set_credential(&self, _credential: Option<Credential>) {}
}

/// Configuration for the fetch orchestrator
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Timeout applied to each request unless the request overrides it
    pub request_timeout: Duration,

    /// Maximum requests in flight for one batch
    pub max_batch_concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            max_batch_concurrency: 8,
        }
    }
}

/// Outcome of one request inside a batch
#[derive(Debug)]
pub struct BatchResult {
    pub success: bool,
    pub data: Option<Arc<Value>>,
    pub error: Option<SyncError>,
}

impl BatchResult {
    fn from_result(result: SyncResult<Arc<Value>>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }

    /// Decode the payload of a successful item
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_deref()
            .and_then(|value| T::deserialize(value).ok())
    }
}

/// Cache-backed request orchestrator
pub struct Fetcher<B> {
    backend: Arc<B>,
    cache: Arc<ResponseCache>,
    config: FetchConfig,
}

impl<B: Backend> Fetcher<B> {
    pub fn new(backend: Arc<B>, cache: Arc<ResponseCache>, config: FetchConfig) -> Self {
        Self {
            backend,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Fetch the raw payload, from cache when fresh
    pub async fn fetch_value(&self, request: &FetchRequest) -> SyncResult<Arc<Value>> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            trace!(key = %key, "Cache hit");
            return Ok(hit);
        }

        debug!(key = %key, "Cache miss, fetching");
        let payload = Arc::new(self.load(request).await?);
        self.cache.set_shared(key, Arc::clone(&payload), request.ttl);
        Ok(payload)
    }

    /// Fetch and decode into `T`.
    ///
    /// A payload that does not decode is reported as `MalformedPayload` and
    /// is not left in the cache.
    pub async fn fetch<T: DeserializeOwned>(&self, request: &FetchRequest) -> SyncResult<T> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            return match decode::<T>(&request.target, &hit) {
                Ok(typed) => Ok(typed),
                Err(e) => {
                    self.cache.invalidate(&key);
                    Err(e)
                }
            };
        }

        let payload = self.load(request).await?;
        let typed = decode::<T>(&request.target, &payload)?;
        self.cache.set(key, payload, request.ttl);
        Ok(typed)
    }

    /// Always hit the network, then refresh the cache entry
    pub async fn fetch_fresh<T: DeserializeOwned>(&self, request: &FetchRequest) -> SyncResult<T> {
        let payload = self.load(request).await?;
        let typed = decode::<T>(&request.target, &payload)?;
        self.cache.set(request.cache_key(), payload, request.ttl);
        Ok(typed)
    }

    /// Run independent requests concurrently.
    ///
    /// The result has one entry per request, in input order. A failing
    /// request only affects its own entry.
    pub async fn parallel_fetch(&self, requests: Vec<FetchRequest>) -> Vec<BatchResult> {
        let limit = self.config.max_batch_concurrency.max(1);
        let count = requests.len();

        let results: Vec<BatchResult> = stream::iter(requests)
            .map(|request| async move {
                let result = self.fetch_value(&request).await;
                if let Err(e) = &result {
                    debug!(endpoint = %request.target, error = %e, "Batch item failed");
                }
                BatchResult::from_result(result)
            })
            .buffered(limit)
            .collect()
            .await;

        let failed = results.iter().filter(|r| !r.success).count();
        debug!(count, failed, "Batch fetch complete");
        results
    }

    async fn load(&self, request: &FetchRequest) -> SyncResult<Value> {
        let timeout = request.timeout.unwrap_or(self.config.request_timeout);
        match tokio::time::timeout(timeout, self.backend.get_json(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation: format!("GET {}", request.target),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl<B: Backend> Fetcher<B> {
    /// Warm the cache for requests the UI is likely to make next.
    ///
    /// Runs in the background. Requests that are already cached are skipped
    /// and failures are only logged.
    pub fn preload(self: &Arc<Self>, requests: Vec<FetchRequest>) -> JoinHandle<()> {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let pending: Vec<FetchRequest> = requests
                .into_iter()
                .filter(|request| !fetcher.cache.contains_fresh(&request.cache_key()))
                .collect();

            if pending.is_empty() {
                return;
            }

            let limit = fetcher.config.max_batch_concurrency.max(1);
            stream::iter(pending)
                .for_each_concurrent(limit, |request| {
                    let fetcher = Arc::clone(&fetcher);
                    async move {
                        if let Err(e) = fetcher.fetch_value(&request).await {
                            warn!(endpoint = %request.target, error = %e, "Preload failed");
                        }
                    }
                })
                .await;
        })
    }
}

fn decode<T: DeserializeOwned>(source: &str, payload: &Value) -> SyncResult<T> {
    T::deserialize(payload).map_err(|e| SyncError::malformed(source, e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::test_support::MockBackend;
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn fetcher(backend: Arc<MockBackend>) -> Fetcher<MockBackend> {
        Fetcher::new(
            backend,
            Arc::new(ResponseCache::with_defaults()),
            FetchConfig::default(),
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Category {
        id: u32,
        name: String,
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_fetched_once_within_ttl() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/categories", json!([{"id": 1, "name": "Shoes"}]));
        let fetcher = fetcher(Arc::clone(&backend));

        let request = FetchRequest::get("/api/categories");
        for _ in 0..5 {
            let categories: Vec<Category> = fetcher.fetch(&request).await.unwrap();
            assert_eq!(categories[0].name, "Shoes");
            tokio::time::advance(Duration::from_secs(12)).await;
        }

        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let backend = Arc::new(MockBackend::new());
        backend.fail("/api/products", "connection reset");
        let fetcher = fetcher(Arc::clone(&backend));
        let request = FetchRequest::get("/api/products").param("page", 1);

        let err = fetcher.fetch_value(&request).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkFailure { .. }));
        assert!(fetcher.cache().is_empty());

        backend.respond("/api/products", json!({"items": []}));
        assert!(fetcher.fetch_value(&request).await.is_ok());
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported_and_not_cached() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/categories", json!({"unexpected": true}));
        let fetcher = fetcher(Arc::clone(&backend));

        let err = fetcher
            .fetch::<Vec<Category>>(&FetchRequest::get("/api/categories"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::MalformedPayload { .. }));
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_timeout() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/slow", json!({}));
        backend.delay("/api/slow", Duration::from_secs(30));
        let fetcher = fetcher(Arc::clone(&backend));

        let err = fetcher
            .fetch_value(&FetchRequest::get("/api/slow").with_timeout(Duration::from_secs(10)))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { timeout_ms: 10_000, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_fetch_preserves_order_with_mixed_outcomes() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/a", json!("a"));
        backend.fail("/api/b", "boom");
        backend.respond("/api/c", json!("c"));
        backend.respond("/api/slow", json!("slow"));
        // Finishes last but must stay first in the output
        backend.delay("/api/slow", Duration::from_secs(5));
        let fetcher = fetcher(Arc::clone(&backend));

        let results = fetcher
            .parallel_fetch(vec![
                FetchRequest::get("/api/slow"),
                FetchRequest::get("/api/a"),
                FetchRequest::get("/api/b"),
                FetchRequest::get("/api/c"),
                FetchRequest::get("/api/missing"),
            ])
            .await;

        assert_eq!(results.len(), 5);
        let flags: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, true, false, true, false]);
        assert_eq!(results[0].decode::<String>().as_deref(), Some("slow"));
        assert_eq!(results[3].decode::<String>().as_deref(), Some("c"));
        assert!(results[2].data.is_none());
        assert!(matches!(
            results[4].error,
            Some(SyncError::NetworkFailure {
                status: Some(404),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_does_not_affect_siblings() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/hang", json!(null));
        backend.delay("/api/hang", Duration::from_secs(60));
        backend.respond("/api/ok", json!(1));
        let fetcher = fetcher(Arc::clone(&backend));

        let results = fetcher
            .parallel_fetch(vec![
                FetchRequest::get("/api/hang").with_timeout(Duration::from_secs(10)),
                FetchRequest::get("/api/ok"),
            ])
            .await;

        assert!(matches!(results[0].error, Some(SyncError::Timeout { .. })));
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn test_preload_swallows_failures_and_skips_cached() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/categories", json!([]));
        backend.fail("/api/products", "offline");
        let fetcher = Arc::new(fetcher(Arc::clone(&backend)));

        fetcher
            .preload(vec![
                FetchRequest::get("/api/categories"),
                FetchRequest::get("/api/products"),
            ])
            .await
            .unwrap();

        assert!(fetcher
            .cache()
            .contains_fresh(&FetchRequest::get("/api/categories").cache_key()));
        assert_eq!(fetcher.cache().len(), 1);

        fetcher
            .preload(vec![FetchRequest::get("/api/categories")])
            .await
            .unwrap();
        assert_eq!(backend.calls_for("/api/categories"), 1);
    }

    #[tokio::test]
    async fn test_fetch_fresh_bypasses_cache() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("/api/notifications", json!([]));
        let fetcher = fetcher(Arc::clone(&backend));
        let request = FetchRequest::get("/api/notifications");

        let _: Vec<Value> = fetcher.fetch(&request).await.unwrap();
        let _: Vec<Value> = fetcher.fetch_fresh(&request).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }
}
