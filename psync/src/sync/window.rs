//! Window host abstraction
//!
//! The host offers no closure event; callers poll [`WindowHandle::is_closed`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn default_width() -> u32 {
    1200
}

fn default_height() -> u32 {
    800
}

fn default_left() -> i32 {
    100
}

fn default_top() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

/// Geometry and chrome of a pop-out window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFeatures {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_left")]
    pub left: i32,

    #[serde(default = "default_top")]
    pub top: i32,

    #[serde(default = "default_true")]
    pub resizable: bool,

    #[serde(default = "default_true")]
    pub scrollbars: bool,
}

impl Default for WindowFeatures {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            left: default_left(),
            top: default_top(),
            resizable: true,
            scrollbars: true,
        }
    }
}

impl WindowFeatures {
    /// `width=1200,height=800,left=100,top=100,resizable=yes,scrollbars=yes`
    pub fn to_feature_string(&self) -> String {
        let flag = |on: bool| if on { "yes" } else { "no" };
        format!(
            "width={},height={},left={},top={},resizable={},scrollbars={}",
            self.width,
            self.height,
            self.left,
            self.top,
            flag(self.resizable),
            flag(self.scrollbars)
        )
    }
}

/// A window opened by a [`WindowHost`]
pub trait WindowHandle: Send + Sync {
    fn is_closed(&self) -> bool;

    fn close(&self);

    fn focus(&self);
}

/// Opens windows; `None` means the host blocked the window
pub trait WindowHost: Send + Sync {
    fn open(&self, url: &str, name: &str, features: &WindowFeatures) -> Option<Arc<dyn WindowHandle>>;
}

/// Window created by [`SimulatedWindowHost`]
#[derive(Debug)]
pub struct SimulatedWindow {
    pub url: String,
    pub name: String,
    pub features: WindowFeatures,
    closed: AtomicBool,
    focused: AtomicU32,
}

impl SimulatedWindow {
    /// Close the window out-of-band, as a user clicking its close button would
    pub fn user_close(&self) {
        info!(name = %self.name, "Window closed by user");
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn focus_count(&self) -> u32 {
        self.focused.load(Ordering::SeqCst)
    }
}

impl WindowHandle for SimulatedWindow {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        debug!(name = %self.name, "SimulatedWindow::close: called");
        self.closed.store(true, Ordering::SeqCst);
    }

    fn focus(&self) {
        self.focused.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-process window host for the demo and tests
#[derive(Debug, Default)]
pub struct SimulatedWindowHost {
    windows: Mutex<Vec<Arc<SimulatedWindow>>>,
    block_popups: AtomicBool,
}

impl SimulatedWindowHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `open` fail, like a popup blocker
    pub fn set_blocking(&self, blocked: bool) {
        self.block_popups.store(blocked, Ordering::SeqCst);
    }

    /// Most recent window opened under `name`
    pub fn window(&self, name: &str) -> Option<Arc<SimulatedWindow>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|w| w.name == name)
            .cloned()
    }

    pub fn opened_count(&self) -> usize {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl WindowHost for SimulatedWindowHost {
    fn open(&self, url: &str, name: &str, features: &WindowFeatures) -> Option<Arc<dyn WindowHandle>> {
        if self.block_popups.load(Ordering::SeqCst) {
            debug!(%url, "SimulatedWindowHost::open: blocked");
            return None;
        }
        debug!(%url, %name, features = %features.to_feature_string(), "SimulatedWindowHost::open: called");
        let window = Arc::new(SimulatedWindow {
            url: url.to_string(),
            name: name.to_string(),
            features: features.clone(),
            closed: AtomicBool::new(false),
            focused: AtomicU32::new(0),
        });
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(window.clone());
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_string() {
        let features = WindowFeatures {
            scrollbars: false,
            ..Default::default()
        };
        assert_eq!(
            features.to_feature_string(),
            "width=1200,height=800,left=100,top=100,resizable=yes,scrollbars=no"
        );
    }

    #[test]
    fn test_blocked_host_returns_none() {
        let host = SimulatedWindowHost::new();
        host.set_blocking(true);
        assert!(host.open("/panel/a", "panel-a", &WindowFeatures::default()).is_none());
        assert_eq!(host.opened_count(), 0);
    }

    #[test]
    fn test_user_close_is_visible_through_handle() {
        let host = SimulatedWindowHost::new();
        let handle = host.open("/panel/a", "panel-a", &WindowFeatures::default()).unwrap();
        assert!(!handle.is_closed());
        host.window("panel-a").unwrap().user_close();
        assert!(handle.is_closed());
    }
}
