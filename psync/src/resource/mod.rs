//! Resource orchestration: location parameters in, fetched state out
//!
//! A data domain plugs in a [`UrlMapper`] and an [`ApiAdapter`]; the
//! orchestrator wires them to the location and the request coordinator and
//! publishes one [`ResourceState`] with per-slice [`Selector`] streams.

mod adapter;
mod orchestrator;
mod state;
mod stream;

pub use adapter::{
    ApiAdapter, ApiResponse, Data, HIGHLIGHT_PREFIX, UrlMapper, filter_patch, highlight_patch, prefix_highlights,
    split_highlights,
};
pub use orchestrator::{ForwardedChange, OrchestratorError, ResourceOrchestrator, Role};
pub use state::{Highlights, ResourceState};
pub use stream::Selector;
