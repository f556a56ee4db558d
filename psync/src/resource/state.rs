//! ResourceState - the single state object an orchestrator publishes

use serde::{Deserialize, Serialize};

use super::adapter::ApiResponse;
use crate::location::LocationParams;
use crate::request::FetchError;

/// Highlight parameters, keyed without their location prefix
pub type Highlights = LocationParams;

/// Everything a view renders from
///
/// `loading`, `error` and the data fields always describe the most recent
/// fetch outcome: while loading there is no error, after an error the
/// results are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState<F, D, S> {
    pub filters: F,
    pub results: Vec<D>,
    pub total_results: u64,
    pub loading: bool,
    pub error: Option<FetchError>,
    pub statistics: Option<S>,
    pub highlights: Highlights,
}

impl<F, D, S> ResourceState<F, D, S> {
    /// Fresh state with no data
    pub fn new(filters: F, highlights: Highlights) -> Self {
        Self {
            filters,
            results: Vec::new(),
            total_results: 0,
            loading: false,
            error: None,
            statistics: None,
            highlights,
        }
    }

    pub(crate) fn begin_fetch(&mut self) {
        self.loading = true;
        self.error = None;
    }

    pub(crate) fn apply_response(&mut self, response: ApiResponse<D, S>) {
        self.results = response.results;
        self.total_results = response.total;
        self.statistics = response.statistics;
        self.loading = false;
        self.error = None;
    }

    pub(crate) fn apply_error(&mut self, error: FetchError) {
        self.results = Vec::new();
        self.total_results = 0;
        self.loading = false;
        self.error = Some(error);
    }

    /// True once a fetch has succeeded and nothing is pending
    pub fn has_data(&self) -> bool {
        !self.loading && self.error.is_none() && self.total_results > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestState = ResourceState<String, u32, u32>;

    fn response(results: Vec<u32>) -> ApiResponse<u32, u32> {
        ApiResponse {
            total: results.len() as u64,
            results,
            statistics: Some(9),
        }
    }

    #[test]
    fn test_fetch_lifecycle() {
        let mut state = TestState::new("f".to_string(), Highlights::new());
        assert!(!state.loading);

        state.begin_fetch();
        assert!(state.loading);
        assert!(state.error.is_none());

        state.apply_response(response(vec![1, 2, 3]));
        assert!(!state.loading);
        assert_eq!(state.total_results, 3);
        assert_eq!(state.statistics, Some(9));
        assert!(state.has_data());
    }

    #[test]
    fn test_error_clears_results() {
        let mut state = TestState::new("f".to_string(), Highlights::new());
        state.begin_fetch();
        state.apply_response(response(vec![1, 2]));

        state.begin_fetch();
        state.apply_error(FetchError::network("offline"));
        assert!(!state.loading);
        assert!(state.results.is_empty());
        assert_eq!(state.total_results, 0);
        assert!(state.error.is_some());

        state.begin_fetch();
        assert!(state.error.is_none());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let state = TestState::new("f".to_string(), Highlights::new().with("model", "F-150"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["totalResults"], 0);
        assert_eq!(json["highlights"]["model"], "F-150");
        let back: TestState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
