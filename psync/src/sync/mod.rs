//! Cross-window synchronization
//!
//! The primary window owns the location and is the only fetcher. Each
//! pop-out window gets one channel named `{channel-prefix}{panel_id}`; the
//! primary pushes full state snapshots down it and the pop-out sends its
//! writes back up as messages.

mod bridge;
mod channel;
mod config;
mod manager;
mod message;
mod popout;
mod replay;
mod window;

use thiserror::Error;

pub use bridge::PrimaryBridge;
pub use channel::{BroadcastChannel, ChannelHub, ChannelListener};
pub use config::SyncConfig;
pub use manager::{PanelMessage, PopOutManager, PopOutWindowRef};
pub use message::{PopOutMessage, PopOutMessageType, StateSnapshotPayload};
pub use popout::PopOutContext;
pub use replay::{ReplayReceiver, ReplaySubject};
pub use window::{SimulatedWindow, SimulatedWindowHost, WindowFeatures, WindowHandle, WindowHost};

/// Errors from channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel '{0}' is closed")]
    Closed(String),

    #[error("Message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{0:?} message carries no payload")]
    MissingPayload(PopOutMessageType),
}
