//! Filter options cache for reference data (dropdown values, ranges)
//!
//! The raw API payload is kept next to the last transformed option list so
//! a consumer that needs a different view can re-derive it without another
//! round trip, and so secondary windows can receive raw payloads over the
//! sync channel and transform them locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::request::{FetchError, RequestCoordinator};

/// Key prefix for option requests routed through the coordinator
const OPTIONS_KEY_PREFIX: &str = "options:";

/// One selectable option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub value: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl FilterOption {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
            count: None,
        }
    }

    /// Transformer for payloads shaped as `["Ford", "Tesla", ...]`
    pub fn from_string_list(raw: &Value) -> Result<Vec<FilterOption>, FetchError> {
        let items = raw
            .as_array()
            .ok_or_else(|| FetchError::malformed("expected an array of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(FilterOption::new)
                    .ok_or_else(|| FetchError::malformed(format!("expected string option, got {}", item)))
            })
            .collect()
    }

    /// Transformer for payloads shaped as `[{"key": "Ford", "doc_count": 12}, ...]`
    pub fn from_buckets(raw: &Value) -> Result<Vec<FilterOption>, FetchError> {
        let items = raw
            .as_array()
            .ok_or_else(|| FetchError::malformed("expected an array of buckets"))?;
        items
            .iter()
            .map(|item| {
                let key = item
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FetchError::malformed("bucket without a string key"))?;
                Ok(FilterOption {
                    value: key.to_string(),
                    label: key.to_string(),
                    count: item.get("doc_count").and_then(Value::as_u64),
                })
            })
            .collect()
    }
}

/// Fetches raw option payloads (only the primary window has one)
#[async_trait]
pub trait OptionsSource: Send + Sync {
    async fn fetch_raw(&self, endpoint: &str) -> Result<Value, FetchError>;
}

/// Raw payloads keyed by endpoint, as sent to secondary windows
pub type OptionsCacheSnapshot = BTreeMap<String, Value>;

struct OptionsEntry {
    raw: Value,
    options: Option<Vec<FilterOption>>,
}

/// Cache of reference data with no TTL; entries leave only when invalidated
pub struct FilterOptionsCache {
    source: Option<Arc<dyn OptionsSource>>,
    coordinator: Arc<RequestCoordinator>,
    entries: Mutex<HashMap<String, OptionsEntry>>,
}

impl FilterOptionsCache {
    /// Cache backed by a source; fetches are deduplicated by `coordinator`
    pub fn new(source: Arc<dyn OptionsSource>, coordinator: Arc<RequestCoordinator>) -> Self {
        debug!("FilterOptionsCache::new: called");
        Self {
            source: Some(source),
            coordinator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache fed only through [`sync_from_external`](Self::sync_from_external)
    pub fn detached() -> Self {
        debug!("FilterOptionsCache::detached: called");
        Self {
            source: None,
            coordinator: Arc::new(RequestCoordinator::default()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OptionsEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Options for `endpoint`, transformed by `transformer`
    ///
    /// A cached raw payload is reused; otherwise it is fetched once.
    pub async fn get_options<T>(&self, endpoint: &str, transformer: T) -> Result<Vec<FilterOption>, FetchError>
    where
        T: Fn(&Value) -> Result<Vec<FilterOption>, FetchError>,
    {
        debug!(%endpoint, "FilterOptionsCache::get_options: called");
        let raw = match self.get_raw_response(endpoint) {
            Some(raw) => raw,
            None => self.fetch_raw(endpoint).await?,
        };

        let options = transformer(&raw)?;
        if let Some(entry) = self.lock().get_mut(endpoint) {
            entry.options = Some(options.clone());
        }
        Ok(options)
    }

    async fn fetch_raw(&self, endpoint: &str) -> Result<Value, FetchError> {
        let Some(source) = self.source.clone() else {
            return Err(FetchError::Unavailable {
                message: format!("no cached options for '{}' and no source to fetch them", endpoint),
            });
        };

        let owned_endpoint = endpoint.to_string();
        let key = format!("{}{}", OPTIONS_KEY_PREFIX, endpoint);
        let config = self.coordinator.defaults().uncached();
        let raw = self
            .coordinator
            .execute_with(
                &key,
                move || {
                    let source = source.clone();
                    let endpoint = owned_endpoint.clone();
                    async move { source.fetch_raw(&endpoint).await }
                },
                &config,
            )
            .await?;

        info!(%endpoint, "Cached filter options");
        self.lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| OptionsEntry {
                raw: raw.clone(),
                options: None,
            });
        Ok(raw)
    }

    /// The untransformed payload for `endpoint`, if cached
    pub fn get_raw_response(&self, endpoint: &str) -> Option<Value> {
        self.lock().get(endpoint).map(|entry| entry.raw.clone())
    }

    /// The most recently transformed options for `endpoint`, if any
    pub fn cached_options(&self, endpoint: &str) -> Option<Vec<FilterOption>> {
        self.lock().get(endpoint).and_then(|entry| entry.options.clone())
    }

    /// Adopt raw payloads received from another window
    ///
    /// Endpoints not named in `partial` are left untouched.
    pub fn sync_from_external(&self, partial: OptionsCacheSnapshot) {
        debug!(endpoints = partial.len(), "FilterOptionsCache::sync_from_external: called");
        let mut entries = self.lock();
        for (endpoint, raw) in partial {
            let unchanged = entries.get(&endpoint).is_some_and(|entry| entry.raw == raw);
            if !unchanged {
                entries.insert(endpoint, OptionsEntry { raw, options: None });
            }
        }
    }

    /// Raw payloads for every cached endpoint
    pub fn snapshot(&self) -> OptionsCacheSnapshot {
        self.lock()
            .iter()
            .map(|(endpoint, entry)| (endpoint.clone(), entry.raw.clone()))
            .collect()
    }

    pub fn invalidate(&self, endpoint: &str) -> bool {
        debug!(%endpoint, "FilterOptionsCache::invalidate: called");
        self.lock().remove(endpoint).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OptionsSource for CountingSource {
        async fn fetch_raw(&self, endpoint: &str) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            match endpoint {
                "manufacturers" => Ok(json!([
                    {"key": "Ford", "doc_count": 12},
                    {"key": "Tesla", "doc_count": 4}
                ])),
                "colors" => Ok(json!(["red", "blue"])),
                _ => Err(FetchError::from_status(404, "unknown endpoint", None)),
            }
        }
    }

    fn cache() -> (Arc<CountingSource>, FilterOptionsCache) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = FilterOptionsCache::new(source.clone(), Arc::new(RequestCoordinator::default()));
        (source, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transform_reuses_raw_payload() {
        let (source, cache) = cache();

        let with_counts = cache
            .get_options("manufacturers", FilterOption::from_buckets)
            .await
            .unwrap();
        assert_eq!(with_counts[0].count, Some(12));

        let labels_only = cache
            .get_options("manufacturers", |raw| {
                Ok(FilterOption::from_buckets(raw)?
                    .into_iter()
                    .map(|o| FilterOption::new(o.value))
                    .collect())
            })
            .await
            .unwrap();
        assert_eq!(labels_only[1], FilterOption::new("Tesla"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_options("manufacturers"), Some(labels_only));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fetch() {
        let (source, cache) = cache();
        let (a, b) = tokio::join!(
            cache.get_options("colors", FilterOption::from_string_list),
            cache.get_options("colors", FilterOption::from_string_list)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_is_not_cached() {
        let (_source, cache) = cache();
        let result = cache.get_options("missing", FilterOption::from_string_list).await;
        assert!(matches!(result, Err(FetchError::Client { status: 404, .. })));
        assert!(cache.get_raw_response("missing").is_none());
    }

    #[tokio::test]
    async fn test_detached_cache_uses_synced_payloads() {
        let cache = FilterOptionsCache::detached();
        assert!(matches!(
            cache.get_options("colors", FilterOption::from_string_list).await,
            Err(FetchError::Unavailable { .. })
        ));

        let mut snapshot = OptionsCacheSnapshot::new();
        snapshot.insert("colors".to_string(), json!(["green"]));
        cache.sync_from_external(snapshot);

        let options = cache
            .get_options("colors", FilterOption::from_string_list)
            .await
            .unwrap();
        assert_eq!(options, vec![FilterOption::new("green")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_invalidate() {
        let (source, cache) = cache();
        cache
            .get_options("colors", FilterOption::from_string_list)
            .await
            .unwrap();
        assert_eq!(cache.snapshot().get("colors"), Some(&json!(["red", "blue"])));

        assert!(cache.invalidate("colors"));
        cache
            .get_options("colors", FilterOption::from_string_list)
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_transformers_reject_wrong_shape() {
        assert!(FilterOption::from_string_list(&json!({"a": 1})).is_err());
        assert!(FilterOption::from_buckets(&json!([{"doc_count": 1}])).is_err());
    }
}
