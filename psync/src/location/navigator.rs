//! The underlying navigation primitive
//!
//! Only [`LocationState`](super::LocationState) may call a [`Navigator`].

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::LocationError;
use super::params::LocationParams;

/// Moves the visible location to a complete parameter set
pub trait Navigator: Send + Sync {
    /// Navigate to `params`; `replace` overwrites the current history entry
    ///
    /// Called without the location lock held, so an implementation may
    /// report back through `LocationState::observe_external`. It must not
    /// call `merge` or `clear` on the same service.
    fn navigate(&self, params: &LocationParams, replace: bool) -> Result<(), LocationError>;

    /// The location the navigator currently shows
    fn current(&self) -> LocationParams;
}

#[derive(Debug, Default)]
struct History {
    entries: Vec<LocationParams>,
    cursor: usize,
    navigations: usize,
}

/// In-memory session history with push/replace and back/forward
#[derive(Debug, Clone)]
pub struct HistoryNavigator {
    inner: Arc<Mutex<History>>,
}

impl HistoryNavigator {
    pub fn new(initial: LocationParams) -> Self {
        debug!(%initial, "HistoryNavigator::new: called");
        Self {
            inner: Arc::new(Mutex::new(History {
                entries: vec![initial],
                cursor: 0,
                navigations: 0,
            })),
        }
    }

    /// Start from a query string such as `?manufacturer=Ford&page=1`
    pub fn from_query(query: &str) -> Self {
        Self::new(LocationParams::from_query_string(query))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, History> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Step back one entry, returning the location now shown
    pub fn back(&self) -> Option<LocationParams> {
        let mut history = self.lock();
        if history.cursor == 0 {
            debug!("HistoryNavigator::back: at oldest entry");
            return None;
        }
        history.cursor -= 1;
        Some(history.entries[history.cursor].clone())
    }

    /// Step forward one entry, returning the location now shown
    pub fn forward(&self) -> Option<LocationParams> {
        let mut history = self.lock();
        if history.cursor + 1 >= history.entries.len() {
            debug!("HistoryNavigator::forward: at newest entry");
            return None;
        }
        history.cursor += 1;
        Some(history.entries[history.cursor].clone())
    }

    /// Number of history entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Total number of `navigate` calls received
    pub fn navigation_count(&self) -> usize {
        self.lock().navigations
    }
}

impl Default for HistoryNavigator {
    fn default() -> Self {
        Self::new(LocationParams::new())
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, params: &LocationParams, replace: bool) -> Result<(), LocationError> {
        debug!(%params, replace, "HistoryNavigator::navigate: called");
        let mut history = self.lock();
        history.navigations += 1;
        if replace {
            let cursor = history.cursor;
            history.entries[cursor] = params.clone();
        } else {
            let keep = history.cursor + 1;
            history.entries.truncate(keep);
            history.entries.push(params.clone());
            history.cursor = history.entries.len() - 1;
        }
        Ok(())
    }

    fn current(&self) -> LocationParams {
        let history = self.lock();
        history.entries[history.cursor].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_replace() {
        let nav = HistoryNavigator::from_query("page=1");
        nav.navigate(&LocationParams::new().with("page", 2i64), false).unwrap();
        assert_eq!(nav.len(), 2);

        nav.navigate(&LocationParams::new().with("page", 3i64), true).unwrap();
        assert_eq!(nav.len(), 2);
        assert_eq!(nav.current().get_i64("page"), Some(3));
        assert_eq!(nav.navigation_count(), 2);
    }

    #[test]
    fn test_back_forward() {
        let nav = HistoryNavigator::from_query("page=1");
        nav.navigate(&LocationParams::new().with("page", 2i64), false).unwrap();

        assert_eq!(nav.back().and_then(|p| p.get_i64("page")), Some(1));
        assert!(nav.back().is_none());
        assert_eq!(nav.forward().and_then(|p| p.get_i64("page")), Some(2));
        assert!(nav.forward().is_none());
    }

    #[test]
    fn test_push_after_back_truncates_forward_entries() {
        let nav = HistoryNavigator::from_query("page=1");
        nav.navigate(&LocationParams::new().with("page", 2i64), false).unwrap();
        nav.back();
        nav.navigate(&LocationParams::new().with("page", 5i64), false).unwrap();
        assert_eq!(nav.len(), 2);
        assert!(nav.forward().is_none());
    }
}
