//! Fetch error taxonomy

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a data producer can fail with
///
/// Cloneable because one failure is handed to every caller sharing a
/// deduplicated request, and serializable because it travels inside state
/// snapshots to secondary windows.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FetchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Timeout after {after:?}")]
    Timeout { after: Duration },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Malformed response: {message}")]
    Malformed { message: String },

    #[error("Request aborted: {message}")]
    Aborted { message: String },

    #[error("Not available: {message}")]
    Unavailable { message: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        FetchError::Network {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        FetchError::Malformed {
            message: message.into(),
        }
    }

    /// Classify an HTTP status code that is not a success
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => FetchError::RateLimited {
                retry_after: retry_after.unwrap_or(Duration::ZERO),
            },
            408 | 500..=599 => FetchError::Server { status, message },
            _ => FetchError::Client { status, message },
        }
    }

    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }

    /// Transport and server failures are retried; everything else surfaces at once
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Timeout { .. } => true,
            FetchError::RateLimited { .. } => true,
            FetchError::Server { .. } => true,
            FetchError::Client { .. } => false,
            FetchError::Malformed { .. } => false,
            FetchError::Aborted { .. } => false,
            FetchError::Unavailable { .. } => false,
        }
    }

    /// Server-requested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::malformed(err.to_string())
    }
}
