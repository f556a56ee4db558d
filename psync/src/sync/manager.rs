//! PopOutManager - the primary window's table of open pop-out windows
//!
//! Each tracked window owns a dedicated channel, a listener task that
//! forwards inbound messages to [`PopOutManager::messages`], and a liveness
//! task polling the window handle. A window closed out-of-band is dropped
//! from the table within one poll interval and reported on
//! [`PopOutManager::closed`] exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::channel::{BroadcastChannel, ChannelHub, ChannelListener};
use super::config::SyncConfig;
use super::message::{PopOutMessage, PopOutMessageType};
use super::window::{WindowFeatures, WindowHandle, WindowHost};
use crate::options::OptionsCacheSnapshot;
use crate::resource::ResourceState;

/// Event stream capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A message received from one pop-out window
#[derive(Debug, Clone, PartialEq)]
pub struct PanelMessage {
    pub panel_id: String,
    pub message: PopOutMessage,
}

/// Everything the primary holds for one open pop-out window
pub struct PopOutWindowRef {
    pub panel_id: String,
    pub panel_type: String,
    pub opened_at: DateTime<Utc>,
    generation: u64,
    handle: Arc<dyn WindowHandle>,
    channel: BroadcastChannel,
    listener: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

impl PopOutWindowRef {
    fn post(&self, message: &PopOutMessage) -> bool {
        match self.channel.post(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(panel_id = %self.panel_id, error = %e, "Failed to deliver message to pop-out");
                false
            }
        }
    }
}

struct Tracker {
    windows: Mutex<HashMap<String, PopOutWindowRef>>,
    generation: AtomicU64,
    messages_tx: broadcast::Sender<PanelMessage>,
    closed_tx: broadcast::Sender<String>,
    blocked_tx: broadcast::Sender<String>,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PopOutWindowRef>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove `panel_id` if it is still the window opened as `generation`
    fn remove_detected(&self, panel_id: &str, generation: u64) -> bool {
        let removed = {
            let mut windows = self.lock();
            match windows.get(panel_id) {
                Some(window) if window.generation == generation => windows.remove(panel_id),
                _ => None,
            }
        };
        match removed {
            Some(window) => {
                info!(%panel_id, "Pop-out window closed out-of-band");
                self.release(window);
                true
            }
            None => false,
        }
    }

    /// Tear down a ref already removed from the table and report the closure
    fn release(&self, window: PopOutWindowRef) {
        window.listener.abort();
        window.liveness.abort();
        window.channel.close();
        debug!(panel_id = %window.panel_id, "PopOutManager: window released");
        let _ = self.closed_tx.send(window.panel_id);
    }
}

/// Opens, tracks and messages pop-out windows
pub struct PopOutManager {
    host: Arc<dyn WindowHost>,
    hub: ChannelHub,
    config: SyncConfig,
    features: WindowFeatures,
    tracker: Arc<Tracker>,
}

impl PopOutManager {
    pub fn new(host: Arc<dyn WindowHost>, hub: ChannelHub, config: SyncConfig, features: WindowFeatures) -> Self {
        debug!(?config, "PopOutManager::new: called");
        let (messages_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (blocked_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            host,
            hub,
            config,
            features,
            tracker: Arc::new(Tracker {
                windows: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                messages_tx,
                closed_tx,
                blocked_tx,
            }),
        }
    }

    /// Open a pop-out for `panel_id`
    ///
    /// Returns false when the panel is already open (the existing window is
    /// focused instead) or when the host blocked the window.
    pub fn open(&self, panel_id: &str, panel_type: &str, features: Option<&WindowFeatures>) -> bool {
        debug!(%panel_id, %panel_type, "PopOutManager::open: called");
        let mut windows = self.tracker.lock();

        if let Some(existing) = windows.get(panel_id)
            && !existing.handle.is_closed()
        {
            info!(%panel_id, "Pop-out already open, focusing it");
            let handle = existing.handle.clone();
            let delay = self.config.focus_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle.focus();
            });
            return false;
        }
        // Closed but not yet noticed by the liveness poll
        let stale = windows.remove(panel_id);

        let name = self.config.channel_name(panel_id);
        let url = self.config.panel_url(panel_id, panel_type);
        let features = features.unwrap_or(&self.features);
        let Some(handle) = self.host.open(&url, &name, features) else {
            drop(windows);
            if let Some(stale) = stale {
                self.tracker.release(stale);
            }
            warn!(%panel_id, %url, "Pop-out window was blocked");
            let _ = self.tracker.blocked_tx.send(panel_id.to_string());
            return false;
        };

        let channel = self.hub.open(&name);
        let listener = match channel.listen() {
            Ok(listener) => listener,
            Err(e) => {
                warn!(%panel_id, error = %e, "Could not listen on pop-out channel");
                handle.close();
                return false;
            }
        };

        let generation = self.tracker.generation.fetch_add(1, Ordering::SeqCst);
        let listener = self.spawn_listener(panel_id, listener);
        let liveness = self.spawn_liveness(panel_id, generation, handle.clone());
        windows.insert(
            panel_id.to_string(),
            PopOutWindowRef {
                panel_id: panel_id.to_string(),
                panel_type: panel_type.to_string(),
                opened_at: Utc::now(),
                generation,
                handle,
                channel,
                listener,
                liveness,
            },
        );
        drop(windows);

        if let Some(stale) = stale {
            self.tracker.release(stale);
        }
        info!(%panel_id, %panel_type, %url, "Opened pop-out window");
        true
    }

    fn spawn_listener(&self, panel_id: &str, mut listener: ChannelListener) -> JoinHandle<()> {
        let panel_id = panel_id.to_string();
        let messages_tx = self.tracker.messages_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = listener.recv().await {
                debug!(%panel_id, kind = ?message.kind, "PopOutManager: message from pop-out");
                let _ = messages_tx.send(PanelMessage {
                    panel_id: panel_id.clone(),
                    message,
                });
            }
        })
    }

    fn spawn_liveness(&self, panel_id: &str, generation: u64, handle: Arc<dyn WindowHandle>) -> JoinHandle<()> {
        let panel_id = panel_id.to_string();
        let tracker: Weak<Tracker> = Arc::downgrade(&self.tracker);
        let period = self.config.liveness_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if !handle.is_closed() {
                    continue;
                }
                if let Some(tracker) = tracker.upgrade() {
                    tracker.remove_detected(&panel_id, generation);
                }
                break;
            }
        })
    }

    /// Send a state snapshot to every open pop-out; returns how many accepted it
    ///
    /// Delivery failures are logged and otherwise ignored.
    pub fn broadcast<F, D, S>(&self, state: &ResourceState<F, D, S>, options: Option<&OptionsCacheSnapshot>) -> usize
    where
        F: Serialize,
        D: Serialize,
        S: Serialize,
    {
        let message = match PopOutMessage::state_update(state, options) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode state snapshot");
                return 0;
            }
        };
        let windows = self.tracker.lock();
        let delivered = windows.values().filter(|window| window.post(&message)).count();
        debug!(delivered, open = windows.len(), "PopOutManager::broadcast: done");
        delivered
    }

    /// Send one message to `panel_id`; false when not open or delivery failed
    pub fn send(&self, panel_id: &str, message: &PopOutMessage) -> bool {
        debug!(%panel_id, kind = ?message.kind, "PopOutManager::send: called");
        self.tracker
            .lock()
            .get(panel_id)
            .is_some_and(|window| window.post(message))
    }

    /// Ask the pop-out to close, close its window and stop tracking it
    pub fn close(&self, panel_id: &str) -> bool {
        debug!(%panel_id, "PopOutManager::close: called");
        let removed = self.tracker.lock().remove(panel_id);
        match removed {
            Some(window) => {
                self.shut(window);
                true
            }
            None => false,
        }
    }

    /// Close every tracked pop-out; returns how many were open
    pub fn close_all(&self) -> usize {
        let windows: Vec<PopOutWindowRef> = self.tracker.lock().drain().map(|(_, window)| window).collect();
        let count = windows.len();
        if count > 0 {
            info!(count, "Closing all pop-out windows");
        }
        for window in windows {
            self.shut(window);
        }
        count
    }

    fn shut(&self, window: PopOutWindowRef) {
        window.post(&PopOutMessage::new(PopOutMessageType::ClosePanel));
        window.handle.close();
        self.tracker.release(window);
    }

    pub fn is_open(&self, panel_id: &str) -> bool {
        self.tracker.lock().contains_key(panel_id)
    }

    /// Ids of tracked pop-outs, sorted
    pub fn open_panels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracker.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Type of the pop-out tracked under `panel_id`
    pub fn panel_type(&self, panel_id: &str) -> Option<String> {
        self.tracker.lock().get(panel_id).map(|window| window.panel_type.clone())
    }

    /// Inbound messages from every pop-out
    pub fn messages(&self) -> broadcast::Receiver<PanelMessage> {
        self.tracker.messages_tx.subscribe()
    }

    /// Ids of pop-outs that stopped being tracked
    pub fn closed(&self) -> broadcast::Receiver<String> {
        self.tracker.closed_tx.subscribe()
    }

    /// Ids of pop-outs the host refused to open
    pub fn blocked(&self) -> broadcast::Receiver<String> {
        self.tracker.blocked_tx.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl Drop for PopOutManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
