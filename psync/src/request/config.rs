//! Request coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Per-call options for [`RequestCoordinator::execute`](super::RequestCoordinator::execute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// How long a successful response stays valid in milliseconds
    #[serde(rename = "cache-ttl-ms", default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Retries after the first attempt for retryable failures
    #[serde(rename = "retry-attempts", default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff delay in milliseconds, doubled per retry
    #[serde(rename = "retry-delay-ms", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Bypass both cache lookup and cache store
    #[serde(rename = "skip-cache", default)]
    pub skip_cache: bool,
}

fn default_cache_ttl_ms() -> u64 {
    debug!("default_cache_ttl_ms: called");
    30_000
}

fn default_retry_attempts() -> u32 {
    debug!("default_retry_attempts: called");
    3
}

fn default_retry_delay_ms() -> u64 {
    debug!("default_retry_delay_ms: called");
    1000
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            skip_cache: false,
        }
    }
}

impl RequestConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Delay before retry `n` (1-based): `retry_delay * 2^(n-1)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    /// Same settings with caching disabled
    pub fn uncached(&self) -> Self {
        Self {
            skip_cache: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RequestConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert!(!config.skip_cache);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RequestConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: RequestConfig = serde_yaml::from_str("retry-attempts: 1").unwrap();
        assert_eq!(config.retry_attempts, 1);
        assert_eq!(config.cache_ttl_ms, 30_000);
    }
}
