//! RequestCoordinator - response cache, in-flight dedup and retry
//!
//! `execute` resolves a keyed request in three layers:
//! 1. a live cache hit returns immediately
//! 2. an identical in-flight request is joined, not restarted
//! 3. otherwise the producer runs under retry-with-exponential-backoff
//!
//! The in-flight entry is removed when the request settles, before any
//! caller observes the result, so the next call for the key starts fresh.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cache::{CachedValue, ResponseCache};
use super::config::RequestConfig;
use super::error::FetchError;

type InFlight = Shared<BoxFuture<'static, Result<CachedValue, FetchError>>>;

/// Counters for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetrics {
    pub cache_hits: u64,
    pub dedup_joins: u64,
    pub requests_started: u64,
    pub producer_calls: u64,
    pub retries: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Registry {
    cache: ResponseCache,
    in_flight: HashMap<String, InFlight>,
    loading: HashSet<String>,
    metrics: RequestMetrics,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Data-shape agnostic request executor
///
/// One instance per scope; the cache and in-flight registry are never shared
/// across coordinators.
pub struct RequestCoordinator {
    registry: Arc<Mutex<Registry>>,
    loading_tx: watch::Sender<bool>,
    defaults: RequestConfig,
}

impl RequestCoordinator {
    pub fn new(defaults: RequestConfig) -> Self {
        debug!(?defaults, "RequestCoordinator::new: called");
        let (loading_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            loading_tx,
            defaults,
        }
    }

    /// The configuration used by [`execute`](Self::execute)
    pub fn defaults(&self) -> &RequestConfig {
        &self.defaults
    }

    /// Execute with the coordinator's default configuration
    pub async fn execute<T, F, Fut>(&self, key: &str, producer: F) -> Result<T, FetchError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let config = self.defaults.clone();
        self.execute_with(key, producer, &config).await
    }

    /// Execute with explicit per-call configuration
    pub async fn execute_with<T, F, Fut>(&self, key: &str, producer: F, config: &RequestConfig) -> Result<T, FetchError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        debug!(%key, skip_cache = config.skip_cache, "RequestCoordinator::execute: called");

        let pending = {
            let mut registry = lock(&self.registry);

            if !config.skip_cache
                && let Some(hit) = registry.cache.get(key)
            {
                debug!(%key, "RequestCoordinator::execute: cache hit");
                registry.metrics.cache_hits += 1;
                return downcast(key, hit);
            }

            if let Some(existing) = registry.in_flight.get(key) {
                debug!(%key, "RequestCoordinator::execute: joining in-flight request");
                let existing = existing.clone();
                registry.metrics.dedup_joins += 1;
                existing
            } else {
                let pending = self.start(key, producer, config.clone());
                registry.in_flight.insert(key.to_string(), pending.clone());
                registry.loading.insert(key.to_string());
                registry.metrics.requests_started += 1;
                self.loading_tx.send_replace(true);
                pending
            }
        };

        let value = pending.await?;
        downcast(key, value)
    }

    fn start<T, F, Fut>(&self, key: &str, producer: F, config: RequestConfig) -> InFlight
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let task_key = key.to_string();
        let task_registry = self.registry.clone();
        let task_loading = self.loading_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = run_with_retry(&task_key, producer, &config, &task_registry)
                .await
                .map(|value| Arc::new(value) as CachedValue);

            let mut registry = lock(&task_registry);
            match &outcome {
                Ok(value) if !config.skip_cache => {
                    registry.cache.insert(task_key.clone(), value.clone(), config.cache_ttl());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %task_key, error = %e, "Request failed");
                    registry.metrics.failures += 1;
                }
            }
            settle(&mut registry, &task_key, &task_loading);
            outcome
        });

        let join_key = key.to_string();
        let join_registry = self.registry.clone();
        let join_loading = self.loading_tx.clone();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(key = %join_key, error = %e, "Request task aborted");
                    let mut registry = lock(&join_registry);
                    settle(&mut registry, &join_key, &join_loading);
                    Err(FetchError::Aborted { message: e.to_string() })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Whether a request for `key` is in flight
    pub fn is_loading(&self, key: &str) -> bool {
        lock(&self.registry).loading.contains(key)
    }

    /// Whether any request is in flight
    pub fn any_loading(&self) -> bool {
        !lock(&self.registry).loading.is_empty()
    }

    /// Global loading indicator stream
    pub fn loading_changes(&self) -> watch::Receiver<bool> {
        self.loading_tx.subscribe()
    }

    pub fn metrics(&self) -> RequestMetrics {
        lock(&self.registry).metrics.clone()
    }

    /// Drop the cached response for `key`
    pub fn invalidate(&self, key: &str) -> bool {
        debug!(%key, "RequestCoordinator::invalidate: called");
        lock(&self.registry).cache.remove(key)
    }

    /// Drop every cached response whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        debug!(%prefix, "RequestCoordinator::invalidate_prefix: called");
        lock(&self.registry).cache.remove_prefix(prefix)
    }

    pub fn clear_cache(&self) {
        info!("RequestCoordinator::clear_cache: clearing response cache");
        lock(&self.registry).cache.clear();
    }

    /// Reclaim expired entries that were never read again
    pub fn purge_expired(&self) -> usize {
        let purged = lock(&self.registry).cache.purge_expired();
        debug!(purged, "RequestCoordinator::purge_expired: done");
        purged
    }

    /// Stored cache entries, including expired ones not yet evicted
    pub fn cached_entries(&self) -> usize {
        lock(&self.registry).cache.len()
    }
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        Self::new(RequestConfig::default())
    }
}

fn settle(registry: &mut Registry, key: &str, loading_tx: &watch::Sender<bool>) {
    registry.in_flight.remove(key);
    registry.loading.remove(key);
    loading_tx.send_replace(!registry.loading.is_empty());
    debug!(%key, remaining = registry.in_flight.len(), "Request settled");
}

fn downcast<T: Clone + 'static>(key: &str, value: CachedValue) -> Result<T, FetchError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| FetchError::malformed(format!("cached value for '{}' has a different type", key)))
}

async fn run_with_retry<T, F, Fut>(
    key: &str,
    producer: F,
    config: &RequestConfig,
    registry: &Mutex<Registry>,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut retry = 0;
    loop {
        lock(registry).metrics.producer_calls += 1;
        let attempt = producer();
        match attempt.await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry < config.retry_attempts => {
                retry += 1;
                let backoff = config.backoff(retry).max(e.retry_after().unwrap_or_default());
                warn!(
                    %key,
                    retry,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                lock(registry).metrics.retries += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_producer(
        calls: Arc<AtomicU32>,
        value: u32,
        delay: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, FetchError>> + Send + 'static {
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_keys_run_producer_once() {
        let coord = Arc::new(RequestCoordinator::default());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coord = coord.clone();
            let producer = counting_producer(calls.clone(), 7, Duration::from_millis(50));
            handles.push(tokio::spawn(async move { coord.execute("x", producer).await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.metrics().dedup_joins, 4);
        assert!(!coord.any_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_failure_reaches_every_caller() {
        let coord = Arc::new(RequestCoordinator::default());
        let calls = Arc::new(AtomicU32::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<u32, _>(FetchError::from_status(404, "missing", None))
                }
            }
        };
        let other = producer.clone();

        let (a, b) = tokio::join!(coord.execute("k", producer), coord.execute("k", other));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_within_ttl_and_refetch_after() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let config = RequestConfig {
            cache_ttl_ms: 1000,
            ..Default::default()
        };

        let first = coord
            .execute_with("k", counting_producer(calls.clone(), 1, Duration::ZERO), &config)
            .await;
        assert_eq!(first.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(999)).await;
        let cached = coord
            .execute_with("k", counting_producer(calls.clone(), 2, Duration::ZERO), &config)
            .await;
        assert_eq!(cached.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        let fresh = coord
            .execute_with("k", counting_producer(calls.clone(), 3, Duration::ZERO), &config)
            .await;
        assert_eq!(fresh.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_exponential_backoff() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(FetchError::network("connection reset"))
                    } else {
                        Ok("done".to_string())
                    }
                }
            }
        };
        let config = RequestConfig {
            retry_attempts: 2,
            retry_delay_ms: 100,
            ..Default::default()
        };

        let started = tokio::time::Instant::now();
        let value = coord.execute_with("x", producer, &config).await.unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(coord.metrics().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted_surfaces_last_error() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(FetchError::from_status(503, "unavailable", None))
                }
            }
        };
        let config = RequestConfig {
            retry_attempts: 1,
            retry_delay_ms: 10,
            ..Default::default()
        };

        let err = coord.execute_with("x", producer, &config).await.unwrap_err();
        assert!(matches!(err, FetchError::Server { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(FetchError::from_status(400, "bad filter", None))
                }
            }
        };

        assert!(coord.execute("x", producer).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_key_starts_fresh_when_uncached() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let config = RequestConfig::default().uncached();

        coord
            .execute_with("k", counting_producer(calls.clone(), 1, Duration::from_millis(5)), &config)
            .await
            .unwrap();
        let second = coord
            .execute_with("k", counting_producer(calls.clone(), 2, Duration::from_millis(5)), &config)
            .await
            .unwrap();

        assert_eq!(second, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coord.cached_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_indicators() {
        let coord = Arc::new(RequestCoordinator::default());
        let calls = Arc::new(AtomicU32::new(0));
        let mut loading = coord.loading_changes();

        let task = {
            let coord = coord.clone();
            let producer = counting_producer(calls, 1, Duration::from_millis(100));
            tokio::spawn(async move { coord.execute("slow", producer).await })
        };

        loading.changed().await.unwrap();
        assert!(*loading.borrow_and_update());
        assert!(coord.is_loading("slow"));

        task.await.unwrap().unwrap();
        assert!(!coord.is_loading("slow"));
        assert!(!*loading.borrow());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let coord = RequestCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        coord
            .execute("results:a", counting_producer(calls.clone(), 1, Duration::ZERO))
            .await
            .unwrap();
        coord
            .execute("results:b", counting_producer(calls.clone(), 1, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(coord.cached_entries(), 2);

        assert!(coord.invalidate("results:a"));
        assert_eq!(coord.invalidate_prefix("results:"), 1);
        assert_eq!(coord.cached_entries(), 0);
    }
}
