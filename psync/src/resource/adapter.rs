//! Pluggable per-domain collaborators: API adapter and URL mapper

use std::fmt::Debug;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::state::Highlights;
use crate::location::{LocationParams, ParamPatch};
use crate::request::FetchError;

/// Location prefix that marks highlight parameters
pub const HIGHLIGHT_PREFIX: &str = "h_";

/// Bounds every filter, result and statistics type must satisfy
pub trait Data: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// One page of results as returned by the domain API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<D, S> {
    pub results: Vec<D>,
    pub total: u64,
    pub statistics: Option<S>,
}

/// Fetches data for a filter object; supplied per data domain
#[async_trait]
pub trait ApiAdapter<F, D, S>: Send + Sync
where
    F: Data,
{
    async fn fetch(&self, filters: &F, highlights: &Highlights) -> Result<ApiResponse<D, S>, FetchError>;
}

/// Converts between filter objects and location parameters
///
/// Must round-trip: `from_params(&to_params(f)) == f` for every supported `f`.
pub trait UrlMapper<F>: Send + Sync {
    fn to_params(&self, filters: &F) -> LocationParams;

    fn from_params(&self, params: &LocationParams) -> F;
}

/// Split a location into primary-filter params and highlights
pub fn split_highlights(params: &LocationParams) -> (LocationParams, Highlights) {
    params.split_prefixed(HIGHLIGHT_PREFIX)
}

/// Highlights re-keyed with their location prefix
pub fn prefix_highlights(highlights: &Highlights) -> LocationParams {
    highlights
        .iter()
        .map(|(key, value)| (format!("{}{}", HIGHLIGHT_PREFIX, key), value.clone()))
        .collect()
}

/// Patch moving the location from one filter object to another
///
/// Empty values are stripped first, so a filter reset to nothing is removed
/// from the location instead of lingering as `key=`.
pub fn filter_patch<F>(mapper: &dyn UrlMapper<F>, current: &F, next: &F) -> ParamPatch {
    let before = mapper.to_params(current).strip_empty();
    let after = mapper.to_params(next).strip_empty();
    ParamPatch::diff(&before, &after)
}

/// Patch updating highlights; `None` values remove a highlight
pub fn highlight_patch(changes: &ParamPatch) -> ParamPatch {
    changes
        .iter()
        .map(|(key, value)| (format!("{}{}", HIGHLIGHT_PREFIX, key), value.clone()))
        .collect()
}
