//! Request coordination: TTL cache, in-flight dedup, retry with backoff
//!
//! The coordinator is independent of any data shape. Whether a failure is
//! worth retrying is decided by the producer through [`FetchError`].

mod cache;
mod config;
mod coordinator;
mod error;

pub use cache::{CacheEntry, CachedValue, ResponseCache};
pub use config::RequestConfig;
pub use coordinator::{RequestCoordinator, RequestMetrics};
pub use error::FetchError;
