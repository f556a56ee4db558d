//! Location state - the single source of truth for view state
//!
//! Every filter, sort and pagination value lives in one location parameter
//! set. [`LocationState`] owns it, merges partial updates into complete
//! snapshots and is the only caller of the [`Navigator`].

mod navigator;
mod params;
mod service;

use thiserror::Error;

pub use navigator::{HistoryNavigator, Navigator};
pub use params::{LocationParams, ParamPatch, ParamValue};
pub use service::{LocationChanges, LocationState};

/// Errors from location operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LocationError {
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),
}
