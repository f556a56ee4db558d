//! LocationState - owns the current parameter set and its change stream

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::LocationError;
use super::navigator::Navigator;
use super::params::{LocationParams, ParamPatch};

/// Change notification capacity per subscriber
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Owner of the view's location
///
/// Reads never block on I/O. `merge` computes the complete resulting set and
/// issues exactly one navigation with it; a change is announced only when
/// the set differs structurally from the previous one.
pub struct LocationState {
    navigator: Arc<dyn Navigator>,
    current: Mutex<LocationParams>,
    writer: Mutex<()>,
    tx: broadcast::Sender<LocationParams>,
}

impl LocationState {
    /// Create a location service seeded from the navigator's current location
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        let initial = navigator.current();
        info!(%initial, "LocationState::new: called");
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            navigator,
            current: Mutex::new(initial),
            writer: Mutex::new(()),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocationParams> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current parameters
    pub fn read(&self) -> LocationParams {
        self.lock().clone()
    }

    /// Merge a partial update into the location
    ///
    /// Returns whether the location changed. `None` values remove keys.
    pub fn merge(&self, patch: &ParamPatch, replace_history: bool) -> Result<bool, LocationError> {
        debug!(keys = patch.len(), replace_history, "LocationState::merge: called");
        self.write(|current| patch.apply_to(current), replace_history)
    }

    /// Remove every parameter
    pub fn clear(&self, replace_history: bool) -> Result<bool, LocationError> {
        debug!(replace_history, "LocationState::clear: called");
        self.write(|_| LocationParams::new(), replace_history)
    }

    /// Navigate to the set computed from the current one, if it differs
    ///
    /// Writers are serialized by `writer`; the navigator runs without the
    /// `current` lock held so it may report back through `observe_external`.
    fn write(
        &self,
        compute: impl FnOnce(&LocationParams) -> LocationParams,
        replace_history: bool,
    ) -> Result<bool, LocationError> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = self.read();
        let next = compute(&before);
        if next == before {
            debug!("LocationState::write: unchanged, not navigating");
            return Ok(false);
        }
        self.navigator.navigate(&next, replace_history)?;
        let mut current = self.lock();
        self.publish(&mut current, next);
        Ok(true)
    }

    /// Adopt a location the navigator moved to on its own (back/forward)
    pub fn observe_external(&self, params: LocationParams) -> bool {
        debug!(%params, "LocationState::observe_external: called");
        let mut current = self.lock();
        self.publish(&mut current, params)
    }

    fn publish(&self, current: &mut LocationParams, next: LocationParams) -> bool {
        if *current == next {
            debug!("LocationState::publish: unchanged, not notifying");
            return false;
        }
        *current = next.clone();
        info!(location = %next, "Location changed");
        // No subscribers is fine
        let _ = self.tx.send(next);
        true
    }

    /// Stream of distinct parameter sets, starting with the current one
    ///
    /// Every call returns a fresh, independent stream.
    pub fn changes(&self) -> LocationChanges {
        let current = self.lock();
        let rx = self.tx.subscribe();
        debug!(subscribers = self.tx.receiver_count(), "LocationState::changes: new subscriber");
        LocationChanges {
            rx,
            pending: Some(current.clone()),
            last: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Ordered, deduplicated location change stream
pub struct LocationChanges {
    rx: broadcast::Receiver<LocationParams>,
    pending: Option<LocationParams>,
    last: Option<LocationParams>,
}

impl LocationChanges {
    /// Next distinct parameter set, or `None` once the location service is gone
    pub async fn next(&mut self) -> Option<LocationParams> {
        if let Some(initial) = self.pending.take() {
            self.last = Some(initial.clone());
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(params) => {
                    if self.last.as_ref() == Some(&params) {
                        continue;
                    }
                    self.last = Some(params.clone());
                    return Some(params);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "LocationChanges::next: subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("LocationChanges::next: location service dropped");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::HistoryNavigator;
    use std::sync::{OnceLock, Weak};

    fn service(query: &str) -> (Arc<HistoryNavigator>, LocationState) {
        let nav = Arc::new(HistoryNavigator::from_query(query));
        let state = LocationState::new(nav.clone());
        (nav, state)
    }

    #[test]
    fn test_read_initial_location() {
        let (_nav, state) = service("?manufacturer=Ford&page=1");
        let params = state.read();
        assert_eq!(params.get_str("manufacturer").as_deref(), Some("Ford"));
        assert_eq!(params.get_i64("page"), Some(1));
    }

    #[test]
    fn test_merge_issues_one_navigation_with_full_set() {
        let (nav, state) = service("?manufacturer=Ford&page=1");
        let changed = state.merge(&ParamPatch::new().set("page", 2i64), false).unwrap();
        assert!(changed);
        assert_eq!(nav.navigation_count(), 1);

        let shown = nav.current();
        assert_eq!(shown.get_str("manufacturer").as_deref(), Some("Ford"));
        assert_eq!(shown.get_i64("page"), Some(2));
    }

    #[test]
    fn test_merge_null_removes_key() {
        let (nav, state) = service("?manufacturer=Ford&page=1");
        state.merge(&ParamPatch::new().unset("manufacturer"), false).unwrap();
        assert!(!state.read().contains_key("manufacturer"));
        assert!(!nav.current().to_query_string().contains("manufacturer"));
    }

    #[test]
    fn test_merge_same_patch_twice_is_idempotent() {
        let (_nav, state) = service("page=1");
        let patch = ParamPatch::new().set("manufacturer", "Tesla");
        assert!(state.merge(&patch, false).unwrap());
        let once = state.read();
        assert!(!state.merge(&patch, false).unwrap());
        assert_eq!(state.read(), once);
    }

    #[test]
    fn test_noop_merge_leaves_history_alone() {
        let (nav, state) = service("?manufacturer=Ford&page=1");
        let changed = state.merge(&ParamPatch::new().set("page", 1i64), false).unwrap();
        assert!(!changed);
        assert_eq!(nav.navigation_count(), 0);
        assert_eq!(nav.len(), 1);
        assert!(nav.back().is_none());

        let (nav, state) = service("");
        assert!(!state.clear(false).unwrap());
        assert_eq!(nav.navigation_count(), 0);
    }

    /// Navigator that reports every navigation straight back to the service
    struct ReportingNavigator {
        history: HistoryNavigator,
        state: OnceLock<Weak<LocationState>>,
    }

    impl Navigator for ReportingNavigator {
        fn navigate(&self, params: &LocationParams, replace: bool) -> Result<(), LocationError> {
            self.history.navigate(params, replace)?;
            if let Some(state) = self.state.get().and_then(Weak::upgrade) {
                state.observe_external(params.clone());
            }
            Ok(())
        }

        fn current(&self) -> LocationParams {
            self.history.current()
        }
    }

    #[tokio::test]
    async fn test_navigator_may_report_back_during_merge() {
        let nav = Arc::new(ReportingNavigator {
            history: HistoryNavigator::from_query("page=1"),
            state: OnceLock::new(),
        });
        let state = Arc::new(LocationState::new(nav.clone()));
        let _ = nav.state.set(Arc::downgrade(&state));
        let mut changes = state.changes();
        changes.next().await;

        assert!(state.merge(&ParamPatch::new().set("page", 2i64), false).unwrap());
        assert_eq!(state.read().get_i64("page"), Some(2));
        assert_eq!(nav.history.navigation_count(), 1);

        state.merge(&ParamPatch::new().set("page", 3i64), false).unwrap();
        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(2));
        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(3));
    }

    #[test]
    fn test_clear() {
        let (nav, state) = service("?manufacturer=Ford&page=1");
        assert!(state.clear(true).unwrap());
        assert!(state.read().is_empty());
        assert_eq!(nav.len(), 1);
    }

    #[tokio::test]
    async fn test_changes_starts_with_current_and_dedups() {
        let (_nav, state) = service("page=1");
        let mut changes = state.changes();

        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(1));

        state.merge(&ParamPatch::new().set("page", 2i64), false).unwrap();
        state.merge(&ParamPatch::new().set("page", 2i64), false).unwrap();
        state.merge(&ParamPatch::new().set("page", 3i64), false).unwrap();

        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(2));
        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(3));
    }

    #[tokio::test]
    async fn test_changes_is_restartable() {
        let (_nav, state) = service("page=1");
        state.merge(&ParamPatch::new().set("page", 4i64), false).unwrap();

        let mut first = state.changes();
        let mut second = state.changes();
        assert_eq!(first.next().await, second.next().await);
        assert_eq!(state.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_observe_external_emits_without_navigating() {
        let (nav, state) = service("page=1");
        state.merge(&ParamPatch::new().set("page", 2i64), false).unwrap();
        let mut changes = state.changes();
        changes.next().await;

        let back = nav.back().unwrap();
        assert!(state.observe_external(back));
        assert_eq!(changes.next().await.unwrap().get_i64("page"), Some(1));
        assert_eq!(nav.navigation_count(), 1);
    }
}
