//! panelsync - URL-driven state synchronization across windows
//!
//! One location (a URL query) is the single source of truth for a view's
//! filter, sort and pagination state. A primary window maps it to filters,
//! fetches through a caching, deduplicating, retrying coordinator and
//! publishes one state object. Pop-out windows mirror that state over named
//! channels and send their edits back to the primary.
//!
//! # Modules
//!
//! - [`location`] - Location parameters, the navigator and `LocationState`
//! - [`request`] - Request coordinator: TTL cache, in-flight dedup, retry
//! - [`options`] - Filter options cache for reference data
//! - [`resource`] - Resource orchestrator and derived state streams
//! - [`sync`] - Pop-out window manager, channels and message protocol
//! - [`http`] - reqwest-backed API adapter and options source
//! - [`demo`] - In-memory vehicle listing domain
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod demo;
pub mod http;
pub mod location;
pub mod options;
pub mod request;
pub mod resource;
pub mod sync;

// Re-export commonly used types
pub use config::{ApiConfig, Config};
pub use http::{HttpApiAdapter, HttpOptionsSource};
pub use location::{HistoryNavigator, LocationError, LocationParams, LocationState, Navigator, ParamPatch, ParamValue};
pub use options::{FilterOption, FilterOptionsCache, OptionsCacheSnapshot, OptionsSource};
pub use request::{FetchError, RequestConfig, RequestCoordinator, RequestMetrics};
pub use resource::{
    ApiAdapter, ApiResponse, ForwardedChange, Highlights, OrchestratorError, ResourceOrchestrator, ResourceState,
    Role, Selector, UrlMapper,
};
pub use sync::{
    ChannelError, ChannelHub, PopOutContext, PopOutManager, PopOutMessage, PopOutMessageType, PrimaryBridge,
    SyncConfig, WindowFeatures, WindowHost,
};
