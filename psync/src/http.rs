//! HTTP adapters backed by reqwest
//!
//! Outcomes are mapped onto [`FetchError`] so the coordinator can decide
//! what to retry: 429 is rate limiting (honouring `retry-after`), 408 and
//! 5xx are server errors, other 4xx are client errors, connect failures are
//! network errors and undecodable bodies are malformed.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::location::LocationParams;
use crate::options::OptionsSource;
use crate::request::FetchError;
use crate::resource::{ApiAdapter, ApiResponse, Data, Highlights, UrlMapper, prefix_highlights};

/// Parse a `retry-after` header given in seconds
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Clone)]
struct HttpBase {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBase {
    fn from_config(config: &ApiConfig) -> Result<Self, FetchError> {
        let base = url::Url::parse(&config.base_url)
            .map_err(|e| FetchError::Unavailable {
                message: format!("invalid base-url '{}': {}", config.base_url, e),
            })?;
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, endpoint: &str, params: Option<&LocationParams>) -> String {
        let mut url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        if let Some(params) = params
            && !params.is_empty()
        {
            url.push('?');
            url.push_str(&params.to_query_string());
        }
        url
    }

    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        debug!(%url, "HttpBase::get_text: called");
        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout { after: self.timeout }
            } else {
                FetchError::network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            let text = response.text().await.unwrap_or_default();
            debug!(status, "HttpBase::get_text: error status");
            return Err(FetchError::from_status(status, text, retry_after));
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout { after: self.timeout }
            } else {
                FetchError::network(e.to_string())
            }
        })
    }
}

/// Fetches result pages with `GET {base-url}/{results-endpoint}?{filters}`
///
/// Highlights are sent with their `h_` prefix next to the filters.
pub struct HttpApiAdapter<F, D, S> {
    base: HttpBase,
    endpoint: String,
    mapper: Arc<dyn UrlMapper<F>>,
    _marker: PhantomData<fn() -> (D, S)>,
}

impl<F, D, S> HttpApiAdapter<F, D, S> {
    pub fn from_config(config: &ApiConfig, mapper: Arc<dyn UrlMapper<F>>) -> Result<Self, FetchError> {
        debug!(base_url = %config.base_url, "HttpApiAdapter::from_config: called");
        Ok(Self {
            base: HttpBase::from_config(config)?,
            endpoint: config.results_endpoint.clone(),
            mapper,
            _marker: PhantomData,
        })
    }

    /// Request location for `filters` and `highlights`
    pub fn request_url(&self, filters: &F, highlights: &Highlights) -> String {
        let mut params = self.mapper.to_params(filters).strip_empty();
        for (key, value) in prefix_highlights(highlights) {
            params.insert(key, value);
        }
        self.base.url(&self.endpoint, Some(&params))
    }
}

#[async_trait]
impl<F: Data, D: Data, S: Data> ApiAdapter<F, D, S> for HttpApiAdapter<F, D, S> {
    async fn fetch(&self, filters: &F, highlights: &Highlights) -> Result<ApiResponse<D, S>, FetchError> {
        let url = self.request_url(filters, highlights);
        let body = self.base.get_text(&url).await?;
        let response: ApiResponse<D, S> = serde_json::from_str(&body)?;
        debug!(total = response.total, rows = response.results.len(), "HttpApiAdapter::fetch: decoded");
        Ok(response)
    }
}

/// Fetches raw option payloads with `GET {base-url}/{endpoint}`
pub struct HttpOptionsSource {
    base: HttpBase,
}

impl HttpOptionsSource {
    pub fn from_config(config: &ApiConfig) -> Result<Self, FetchError> {
        Ok(Self {
            base: HttpBase::from_config(config)?,
        })
    }
}

#[async_trait]
impl OptionsSource for HttpOptionsSource {
    async fn fetch_raw(&self, endpoint: &str) -> Result<Value, FetchError> {
        let url = self.base.url(endpoint, None);
        let body = self.base.get_text(&url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationParams;

    struct MakeMapper;

    impl UrlMapper<Option<String>> for MakeMapper {
        fn to_params(&self, filters: &Option<String>) -> LocationParams {
            LocationParams::new()
                .with("make", filters.clone().unwrap_or_default())
                .with("page", 1i64)
        }

        fn from_params(&self, params: &LocationParams) -> Option<String> {
            params.get_str("make")
        }
    }

    fn config(base_url: &str) -> ApiConfig {
        ApiConfig {
            base_url: base_url.to_string(),
            timeout_ms: 2000,
            ..Default::default()
        }
    }

    #[test]
    fn test_request_url_strips_empty_and_prefixes_highlights() {
        let adapter: HttpApiAdapter<Option<String>, Value, Value> =
            HttpApiAdapter::from_config(&config("http://localhost:9000/api/"), Arc::new(MakeMapper)).unwrap();

        let url = adapter.request_url(&None, &Highlights::new().with("model", "Y"));
        assert_eq!(url, "http://localhost:9000/api/search?h_model=Y&page=1");

        let url = adapter.request_url(&Some("Ford".to_string()), &Highlights::new());
        assert_eq!(url, "http://localhost:9000/api/search?make=Ford&page=1");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpOptionsSource::from_config(&config("not a url")),
            Err(FetchError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("30")), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable_network_error() {
        let source = HttpOptionsSource::from_config(&config("http://127.0.0.1:1")).unwrap();
        let err = source.fetch_raw("manufacturers").await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. } | FetchError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
