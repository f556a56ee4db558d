//! PopOutContext - the pop-out window's side of the protocol
//!
//! A pop-out renders from snapshots only. Its orchestrator is a secondary
//! one, so filter edits and refreshes leave as messages to the primary.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ChannelError;
use super::channel::{BroadcastChannel, ChannelHub, ChannelListener};
use super::config::SyncConfig;
use super::message::{PopOutMessage, PopOutMessageType};
use crate::location::LocationParams;
use crate::options::FilterOptionsCache;
use crate::resource::{Data, ForwardedChange, ResourceOrchestrator, UrlMapper};

/// Runs in a pop-out window for its lifetime
pub struct PopOutContext<F: Data, D: Data, S: Data> {
    panel_id: String,
    orchestrator: Arc<ResourceOrchestrator<F, D, S>>,
    options: Arc<FilterOptionsCache>,
    channel: Arc<BroadcastChannel>,
    closed_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<F: Data, D: Data, S: Data> PopOutContext<F, D, S> {
    /// Join the panel's channel and announce readiness
    ///
    /// `initial` seeds the filters until the first snapshot arrives.
    pub fn start(
        hub: &ChannelHub,
        config: &SyncConfig,
        panel_id: &str,
        mapper: Arc<dyn UrlMapper<F>>,
        initial: &LocationParams,
    ) -> Result<Self, ChannelError> {
        info!(%panel_id, "PopOutContext::start: called");
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(ResourceOrchestrator::secondary(mapper, initial, outbox_tx));
        let options = Arc::new(FilterOptionsCache::detached());
        let channel = Arc::new(hub.open(&config.channel_name(panel_id)));
        let listener = channel.listen()?;
        let (closed_tx, _) = watch::channel(false);

        let inbound = tokio::spawn(run_inbound(
            panel_id.to_string(),
            listener,
            orchestrator.clone(),
            options.clone(),
            channel.clone(),
            closed_tx.clone(),
        ));
        let outbound = tokio::spawn(run_outbound(panel_id.to_string(), outbox_rx, channel.clone()));

        if let Err(e) = channel.post(&PopOutMessage::new(PopOutMessageType::PanelReady)) {
            warn!(%panel_id, error = %e, "Could not announce readiness");
        }

        Ok(Self {
            panel_id: panel_id.to_string(),
            orchestrator,
            options,
            channel,
            closed_tx,
            tasks: vec![inbound, outbound],
        })
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    /// The secondary orchestrator views render from
    pub fn orchestrator(&self) -> &Arc<ResourceOrchestrator<F, D, S>> {
        &self.orchestrator
    }

    /// Option payloads received from the primary
    pub fn options(&self) -> &Arc<FilterOptionsCache> {
        &self.options
    }

    /// True once the primary asked this window to close or it was closed locally
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves when the window should close
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Leave the channel and stop forwarding
    pub fn close(&self) {
        debug!(panel_id = %self.panel_id, "PopOutContext::close: called");
        for task in &self.tasks {
            task.abort();
        }
        self.channel.close();
        self.orchestrator.destroy();
        self.closed_tx.send_replace(true);
    }
}

impl<F: Data, D: Data, S: Data> Drop for PopOutContext<F, D, S> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_inbound<F: Data, D: Data, S: Data>(
    panel_id: String,
    mut listener: ChannelListener,
    orchestrator: Arc<ResourceOrchestrator<F, D, S>>,
    options: Arc<FilterOptionsCache>,
    channel: Arc<BroadcastChannel>,
    closed_tx: watch::Sender<bool>,
) {
    while let Some(message) = listener.recv().await {
        debug!(%panel_id, kind = ?message.kind, "PopOutContext: message from primary");
        match message.kind {
            PopOutMessageType::StateUpdate => match message.to_snapshot::<F, D, S>() {
                Ok(payload) => {
                    if let Some(cache) = payload.filter_options_cache {
                        options.sync_from_external(cache);
                    }
                    if let Err(e) = orchestrator.sync_from_external(payload.state) {
                        warn!(%panel_id, error = %e, "Could not apply snapshot");
                    }
                }
                Err(e) => warn!(%panel_id, error = %e, "Dropping malformed snapshot"),
            },
            PopOutMessageType::Ping => {
                let echo = match message.payload {
                    Some(payload) => PopOutMessage::with_payload(PopOutMessageType::Ping, payload),
                    None => PopOutMessage::new(PopOutMessageType::Ping),
                };
                if let Err(e) = channel.post(&echo) {
                    warn!(%panel_id, error = %e, "Could not answer ping");
                }
            }
            PopOutMessageType::ClosePanel => {
                info!(%panel_id, "Primary asked pop-out to close");
                channel.close();
                orchestrator.destroy();
                closed_tx.send_replace(true);
                break;
            }
            PopOutMessageType::PanelReady | PopOutMessageType::ChangeParams | PopOutMessageType::Refresh => {
                debug!(%panel_id, kind = ?message.kind, "Ignoring pop-out-bound message");
            }
        }
    }
}

async fn run_outbound(
    panel_id: String,
    mut outbox: mpsc::UnboundedReceiver<ForwardedChange>,
    channel: Arc<BroadcastChannel>,
) {
    while let Some(change) = outbox.recv().await {
        let result = PopOutMessage::forwarded(&change).and_then(|message| channel.post(&message));
        if let Err(e) = result {
            // The pop-out keeps its last snapshot until the primary is back
            warn!(%panel_id, error = %e, "Could not forward change to primary");
        }
    }
}
