//! ResourceOrchestrator - location parameters in, resource state out
//!
//! The primary orchestrator maps every location change to filters and
//! fetches. A secondary orchestrator never fetches and never touches a
//! location: its state arrives as whole snapshots and its writes leave as
//! [`ForwardedChange`] requests for the primary to apply.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::adapter::{self, ApiAdapter, Data, UrlMapper};
use super::state::{Highlights, ResourceState};
use super::stream::Selector;
use crate::location::{LocationError, LocationParams, LocationState, ParamPatch};
use crate::request::{FetchError, RequestCoordinator};

/// Cache key prefix for result pages
const RESULTS_KEY_PREFIX: &str = "results:";

/// Errors from orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Location update failed: {0}")]
    Location(#[from] LocationError),

    #[error("Only a secondary orchestrator accepts external snapshots")]
    NotSecondary,

    #[error("Primary window is no longer reachable")]
    PrimaryUnreachable,

    #[error("Orchestrator has been torn down")]
    TornDown,
}

/// Which side of the window pair this orchestrator serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// A write a secondary window asks the primary to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "kebab-case")]
pub enum ForwardedChange {
    Params(ParamPatch),
    Clear,
    Refresh,
}

enum Backend<F: Data, D, S> {
    Primary {
        location: Arc<LocationState>,
        adapter: Arc<dyn ApiAdapter<F, D, S>>,
        coordinator: Arc<RequestCoordinator>,
    },
    Secondary {
        outbox: mpsc::UnboundedSender<ForwardedChange>,
    },
}

struct Inner<F: Data, D: Data, S: Data> {
    mapper: Arc<dyn UrlMapper<F>>,
    backend: Backend<F, D, S>,
    state_tx: watch::Sender<ResourceState<F, D, S>>,
    fetch_seq: AtomicU64,
    torn_down: AtomicBool,
}

impl<F: Data, D: Data, S: Data> Inner<F, D, S> {
    fn role(&self) -> Role {
        match self.backend {
            Backend::Primary { .. } => Role::Primary,
            Backend::Secondary { .. } => Role::Secondary,
        }
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// The one place state is mutated
    fn update(&self, mutate: impl FnOnce(&mut ResourceState<F, D, S>)) {
        self.state_tx.send_if_modified(|state| {
            let before = state.clone();
            mutate(state);
            *state != before
        });
    }

    fn map_location(&self, params: &LocationParams) -> (F, Highlights) {
        let (filter_params, highlights) = adapter::split_highlights(params);
        (self.mapper.from_params(&filter_params), highlights)
    }

    fn on_location(self: &Arc<Self>, params: LocationParams) {
        if self.is_torn_down() {
            return;
        }
        let (filters, highlights) = self.map_location(&params);
        debug!(?filters, "ResourceOrchestrator: location mapped to filters");
        self.update(|state| {
            state.filters = filters;
            state.highlights = highlights;
        });
        if self.role() == Role::Primary {
            self.fetch(false);
        }
    }

    /// Start a fetch for the current filters; only the latest fetch may land
    fn fetch(self: &Arc<Self>, force: bool) -> Option<JoinHandle<()>> {
        let Backend::Primary {
            adapter: api,
            coordinator,
            ..
        } = &self.backend
        else {
            return None;
        };

        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (filters, highlights) = {
            let state = self.state_tx.borrow();
            (state.filters.clone(), state.highlights.clone())
        };
        self.update(|state| state.begin_fetch());

        let mut key_params = self.mapper.to_params(&filters).strip_empty();
        for (k, v) in adapter::prefix_highlights(&highlights) {
            key_params.insert(k, v);
        }
        let key = format!("{}{}", RESULTS_KEY_PREFIX, key_params.to_query_string());
        let config = if force {
            coordinator.defaults().uncached()
        } else {
            coordinator.defaults().clone()
        };
        info!(%key, seq, force, "Fetching resources");

        let api = api.clone();
        let coordinator = coordinator.clone();
        let inner = self.clone();
        Some(tokio::spawn(async move {
            let producer = move || {
                let api = api.clone();
                let filters = filters.clone();
                let highlights = highlights.clone();
                async move { api.fetch(&filters, &highlights).await }
            };
            let outcome = coordinator.execute_with(&key, producer, &config).await;

            if inner.is_torn_down() {
                debug!(seq, "ResourceOrchestrator: discarding result after teardown");
                return;
            }
            if inner.fetch_seq.load(Ordering::SeqCst) != seq {
                debug!(seq, "ResourceOrchestrator: discarding superseded result");
                return;
            }
            match outcome {
                Ok(response) => {
                    debug!(seq, total = response.total, "ResourceOrchestrator: fetch succeeded");
                    inner.update(|state| state.apply_response(response));
                }
                Err(e) => {
                    warn!(seq, error = %e, "Fetch failed");
                    inner.update(|state| state.apply_error(e));
                }
            }
        }))
    }

    fn route(self: &Arc<Self>, change: ForwardedChange) -> Result<(), OrchestratorError> {
        if self.is_torn_down() {
            return Err(OrchestratorError::TornDown);
        }
        match &self.backend {
            Backend::Primary { location, .. } => {
                match change {
                    ForwardedChange::Params(patch) => {
                        location.merge(&patch, false)?;
                    }
                    ForwardedChange::Clear => {
                        location.clear(false)?;
                    }
                    ForwardedChange::Refresh => {
                        self.fetch(true);
                    }
                }
                Ok(())
            }
            Backend::Secondary { outbox } => {
                debug!(?change, "ResourceOrchestrator: forwarding change to primary");
                outbox.send(change).map_err(|_| OrchestratorError::PrimaryUnreachable)
            }
        }
    }
}

type State<F, D, S> = ResourceState<F, D, S>;

/// Per-view orchestrator; dropping it tears the view down
pub struct ResourceOrchestrator<F: Data, D: Data, S: Data> {
    inner: Arc<Inner<F, D, S>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Data, D: Data, S: Data> ResourceOrchestrator<F, D, S> {
    /// Orchestrator for the primary window
    ///
    /// Maps the current location once without fetching, then follows the
    /// location change stream, whose first item triggers the initial fetch.
    pub fn primary(
        location: Arc<LocationState>,
        mapper: Arc<dyn UrlMapper<F>>,
        adapter: Arc<dyn ApiAdapter<F, D, S>>,
        coordinator: Arc<RequestCoordinator>,
    ) -> Self {
        info!("ResourceOrchestrator::primary: called");
        let changes = location.changes();
        let initial = location.read();
        let backend = Backend::Primary {
            location,
            adapter,
            coordinator,
        };
        let inner = Arc::new(Self::build_inner(mapper, backend, &initial));

        let listener_inner = inner.clone();
        let listener = tokio::spawn(async move {
            let mut changes = changes;
            while let Some(params) = changes.next().await {
                if listener_inner.is_torn_down() {
                    break;
                }
                listener_inner.on_location(params);
            }
            debug!("ResourceOrchestrator: location listener stopped");
        });

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Orchestrator for a pop-out window
    ///
    /// `initial` seeds the filters until the first snapshot arrives; writes
    /// go to `outbox` instead of a location.
    pub fn secondary(
        mapper: Arc<dyn UrlMapper<F>>,
        initial: &LocationParams,
        outbox: mpsc::UnboundedSender<ForwardedChange>,
    ) -> Self {
        info!("ResourceOrchestrator::secondary: called");
        let inner = Arc::new(Self::build_inner(mapper, Backend::Secondary { outbox }, initial));
        Self {
            inner,
            listener: Mutex::new(None),
        }
    }

    fn build_inner(mapper: Arc<dyn UrlMapper<F>>, backend: Backend<F, D, S>, initial: &LocationParams) -> Inner<F, D, S> {
        let (filter_params, highlights) = adapter::split_highlights(initial);
        let filters = mapper.from_params(&filter_params);
        let (state_tx, _) = watch::channel(ResourceState::new(filters, highlights));
        Inner {
            mapper,
            backend,
            state_tx,
            fetch_seq: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    /// Snapshot of the whole state
    pub fn state(&self) -> ResourceState<F, D, S> {
        self.inner.state_tx.borrow().clone()
    }

    /// Raw state stream; every receiver sees the latest value on subscribe
    pub fn subscribe(&self) -> watch::Receiver<ResourceState<F, D, S>> {
        self.inner.state_tx.subscribe()
    }

    pub fn filters(&self) -> Selector<State<F, D, S>, F> {
        Selector::new(self.subscribe(), |s| s.filters.clone())
    }

    pub fn results(&self) -> Selector<State<F, D, S>, Vec<D>> {
        Selector::new(self.subscribe(), |s| s.results.clone())
    }

    pub fn total_results(&self) -> Selector<State<F, D, S>, u64> {
        Selector::new(self.subscribe(), |s| s.total_results)
    }

    pub fn loading(&self) -> Selector<State<F, D, S>, bool> {
        Selector::new(self.subscribe(), |s| s.loading)
    }

    pub fn error(&self) -> Selector<State<F, D, S>, Option<FetchError>> {
        Selector::new(self.subscribe(), |s| s.error.clone())
    }

    pub fn statistics(&self) -> Selector<State<F, D, S>, Option<S>> {
        Selector::new(self.subscribe(), |s| s.statistics.clone())
    }

    pub fn highlights(&self) -> Selector<State<F, D, S>, Highlights> {
        Selector::new(self.subscribe(), |s| s.highlights.clone())
    }

    /// Change filters by editing a copy of the current ones
    ///
    /// State is never mutated here: the difference is written to the
    /// location (or forwarded to the primary) and flows back from there.
    pub fn update_filters(&self, edit: impl FnOnce(&mut F)) -> Result<(), OrchestratorError> {
        let current = self.inner.state_tx.borrow().filters.clone();
        let mut next = current.clone();
        edit(&mut next);

        let patch = adapter::filter_patch(self.inner.mapper.as_ref(), &current, &next);
        debug!(keys = patch.len(), "ResourceOrchestrator::update_filters: called");
        if patch.is_empty() {
            return Ok(());
        }
        self.inner.route(ForwardedChange::Params(patch))
    }

    /// Set or remove highlights; `None` removes a highlight
    pub fn update_highlights(&self, changes: &ParamPatch) -> Result<(), OrchestratorError> {
        debug!(keys = changes.len(), "ResourceOrchestrator::update_highlights: called");
        if changes.is_empty() {
            return Ok(());
        }
        self.inner.route(ForwardedChange::Params(adapter::highlight_patch(changes)))
    }

    pub fn clear_highlights(&self) -> Result<(), OrchestratorError> {
        let current = self.inner.state_tx.borrow().highlights.clone();
        let patch = current.keys().map(|key| (key.clone(), None)).collect::<ParamPatch>();
        self.update_highlights(&patch)
    }

    /// Remove every filter from the location
    pub fn clear_filters(&self) -> Result<(), OrchestratorError> {
        debug!("ResourceOrchestrator::clear_filters: called");
        self.inner.route(ForwardedChange::Clear)
    }

    /// Re-fetch the current filters, bypassing the response cache
    ///
    /// On the primary this resolves once the fetch has landed.
    pub async fn refresh(&self) -> Result<(), OrchestratorError> {
        debug!(role = ?self.role(), "ResourceOrchestrator::refresh: called");
        if self.inner.is_torn_down() {
            return Err(OrchestratorError::TornDown);
        }
        match self.role() {
            Role::Primary => {
                if let Some(task) = self.inner.fetch(true)
                    && let Err(e) = task.await
                {
                    warn!(error = %e, "Refresh task failed");
                }
                Ok(())
            }
            Role::Secondary => self.inner.route(ForwardedChange::Refresh),
        }
    }

    /// Apply a change forwarded by a secondary window (primary only)
    ///
    /// Returns once the change is routed; a forwarded refresh starts its
    /// fetch in the background instead of waiting for it to land.
    pub fn apply_forwarded(&self, change: ForwardedChange) -> Result<(), OrchestratorError> {
        debug!(?change, "ResourceOrchestrator::apply_forwarded: called");
        self.inner.route(change)
    }

    /// Replace local state with a complete snapshot from the primary
    ///
    /// Snapshots are full replacements, never merged with earlier ones.
    pub fn sync_from_external(&self, snapshot: ResourceState<F, D, S>) -> Result<(), OrchestratorError> {
        if self.role() != Role::Secondary {
            return Err(OrchestratorError::NotSecondary);
        }
        if self.inner.is_torn_down() {
            return Err(OrchestratorError::TornDown);
        }
        debug!(total = snapshot.total_results, "ResourceOrchestrator::sync_from_external: called");
        self.inner.state_tx.send_replace(snapshot);
        Ok(())
    }

    /// Stop following the location; results still in flight are discarded
    pub fn destroy(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(role = ?self.role(), "ResourceOrchestrator::destroy: tearing down");
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_torn_down()
    }
}

impl<F: Data, D: Data, S: Data> Drop for ResourceOrchestrator<F, D, S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
