//! Named broadcast channels between windows
//!
//! Every endpoint opened on the same name through one [`ChannelHub`] shares
//! a [`ReplaySubject`]. Messages cross the channel as serialized JSON, and
//! an endpoint never receives its own messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use super::ChannelError;
use super::message::PopOutMessage;
use super::replay::{ReplayReceiver, ReplaySubject};

#[derive(Debug, Clone)]
struct Envelope {
    sender: Uuid,
    body: Arc<str>,
}

type Subject = ReplaySubject<Envelope>;

/// Registry of named channels; clones share the registry
#[derive(Clone)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, Weak<Subject>>>>,
    replay: usize,
}

impl ChannelHub {
    /// Hub whose channels replay the last `replay` messages to late listeners
    pub fn new(replay: usize) -> Self {
        debug!(replay, "ChannelHub::new: called");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            replay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<Subject>>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open an endpoint on `name`, creating the channel if no endpoint holds it
    pub fn open(&self, name: &str) -> BroadcastChannel {
        let mut channels = self.lock();
        channels.retain(|_, subject| subject.strong_count() > 0);
        let subject = match channels.get(name).and_then(Weak::upgrade) {
            Some(subject) => subject,
            None => {
                let subject = Arc::new(Subject::new(self.replay));
                channels.insert(name.to_string(), Arc::downgrade(&subject));
                subject
            }
        };
        let id = Uuid::now_v7();
        debug!(%name, %id, "ChannelHub::open: endpoint opened");
        BroadcastChannel {
            name: name.to_string(),
            id,
            subject: Mutex::new(Some(subject)),
        }
    }

    /// Names of channels that still have an open endpoint
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, subject)| subject.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One endpoint of a named channel
pub struct BroadcastChannel {
    name: String,
    id: Uuid,
    subject: Mutex<Option<Arc<Subject>>>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn subject(&self) -> Result<Arc<Subject>, ChannelError> {
        self.subject
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))
    }

    /// Post to every other endpoint on this channel
    pub fn post(&self, message: &PopOutMessage) -> Result<(), ChannelError> {
        let subject = self.subject()?;
        let body = serde_json::to_string(message)?;
        let reached = subject.next(Envelope {
            sender: self.id,
            body: body.into(),
        });
        debug!(channel = %self.name, kind = ?message.kind, reached, "BroadcastChannel::post: sent");
        Ok(())
    }

    /// Start receiving; buffered messages are delivered first
    pub fn listen(&self) -> Result<ChannelListener, ChannelError> {
        let subject = self.subject()?;
        Ok(ChannelListener {
            name: self.name.clone(),
            own_id: self.id,
            rx: subject.subscribe(),
        })
    }

    /// Release this endpoint; later posts fail with [`ChannelError::Closed`]
    pub fn close(&self) {
        let released = self
            .subject
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if released.is_some() {
            debug!(channel = %self.name, "BroadcastChannel::close: released");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subject
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Inbound side of an endpoint
pub struct ChannelListener {
    name: String,
    own_id: Uuid,
    rx: ReplayReceiver<Envelope>,
}

impl ChannelListener {
    /// Next message from another endpoint; `None` once every endpoint is gone
    ///
    /// Messages that fail to decode are logged and skipped.
    pub async fn recv(&mut self) -> Option<PopOutMessage> {
        loop {
            let envelope = self.rx.recv().await?;
            if envelope.sender == self.own_id {
                continue;
            }
            match serde_json::from_str(&envelope.body) {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!(channel = %self.name, error = %e, "Dropping undecodable message");
                }
            }
        }
    }
}
