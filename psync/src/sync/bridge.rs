//! PrimaryBridge - wires the primary orchestrator to its pop-out windows

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::{PanelMessage, PopOutManager};
use super::message::{PopOutMessage, PopOutMessageType};
use crate::options::FilterOptionsCache;
use crate::resource::{Data, ResourceOrchestrator};

/// Runs on the primary window
///
/// Broadcasts every state change, answers `PANEL_READY` with a snapshot for
/// that panel only, and applies `CHANGE_PARAMS` / `REFRESH` through the
/// orchestrator. Dropping the bridge stops both tasks.
pub struct PrimaryBridge {
    tasks: Vec<JoinHandle<()>>,
}

impl PrimaryBridge {
    pub fn start<F: Data, D: Data, S: Data>(
        orchestrator: Arc<ResourceOrchestrator<F, D, S>>,
        manager: Arc<PopOutManager>,
        options: Option<Arc<FilterOptionsCache>>,
    ) -> Self {
        info!("PrimaryBridge::start: called");
        let broadcaster = {
            let mut states = orchestrator.subscribe();
            let manager = manager.clone();
            let options = options.clone();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = states.borrow_and_update().clone();
                    let snapshot = options.as_ref().map(|cache| cache.snapshot());
                    manager.broadcast(&state, snapshot.as_ref());
                }
                debug!("PrimaryBridge: state stream ended");
            })
        };

        let handler = {
            let mut inbound = manager.messages();
            tokio::spawn(async move {
                loop {
                    match inbound.recv().await {
                        Ok(message) => handle_message(&orchestrator, &manager, options.as_deref(), message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "PrimaryBridge: inbound messages lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            tasks: vec![broadcaster, handler],
        }
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PrimaryBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_message<F: Data, D: Data, S: Data>(
    orchestrator: &ResourceOrchestrator<F, D, S>,
    manager: &PopOutManager,
    options: Option<&FilterOptionsCache>,
    inbound: PanelMessage,
) {
    let PanelMessage { panel_id, message } = inbound;
    debug!(%panel_id, kind = ?message.kind, "PrimaryBridge::handle_message: called");
    match message.kind {
        PopOutMessageType::PanelReady => {
            let state = orchestrator.state();
            let snapshot = options.map(FilterOptionsCache::snapshot);
            match PopOutMessage::state_update(&state, snapshot.as_ref()) {
                Ok(reply) => {
                    manager.send(&panel_id, &reply);
                }
                Err(e) => warn!(%panel_id, error = %e, "Failed to encode snapshot for ready panel"),
            }
        }
        PopOutMessageType::ChangeParams | PopOutMessageType::Refresh => match message.to_forwarded() {
            Ok(Some(change)) => {
                if let Err(e) = orchestrator.apply_forwarded(change) {
                    warn!(%panel_id, error = %e, "Could not apply change from pop-out");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%panel_id, error = %e, "Dropping malformed change from pop-out"),
        },
        PopOutMessageType::Ping => {
            debug!(%panel_id, payload = ?message.payload, "Ping from pop-out");
        }
        PopOutMessageType::StateUpdate | PopOutMessageType::ClosePanel => {
            debug!(%panel_id, kind = ?message.kind, "Ignoring primary-bound message");
        }
    }
}
