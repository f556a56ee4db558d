//! Cross-window synchronization settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_channel_prefix() -> String {
    "panel-".to_string()
}

fn default_liveness_interval_ms() -> u64 {
    500
}

fn default_replay_buffer() -> usize {
    1
}

fn default_url_template() -> String {
    "/panel/{panel_id}?type={panel_type}".to_string()
}

fn default_focus_delay_ms() -> u64 {
    100
}

/// Channel naming, liveness polling and pop-out location settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Prefix of every per-panel channel name
    #[serde(rename = "channel-prefix", default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// How often open pop-out windows are checked for closure
    #[serde(rename = "liveness-interval-ms", default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Messages kept per channel for listeners that attach late
    #[serde(rename = "replay-buffer", default = "default_replay_buffer")]
    pub replay_buffer: usize,

    /// Pop-out location; `{panel_id}` and `{panel_type}` are substituted
    #[serde(rename = "url-template", default = "default_url_template")]
    pub url_template: String,

    /// Delay before focusing a window that is already open
    #[serde(rename = "focus-delay-ms", default = "default_focus_delay_ms")]
    pub focus_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            liveness_interval_ms: default_liveness_interval_ms(),
            replay_buffer: default_replay_buffer(),
            url_template: default_url_template(),
            focus_delay_ms: default_focus_delay_ms(),
        }
    }
}

impl SyncConfig {
    pub fn channel_name(&self, panel_id: &str) -> String {
        format!("{}{}", self.channel_prefix, panel_id)
    }

    /// Location a pop-out window is opened at
    pub fn panel_url(&self, panel_id: &str, panel_type: &str) -> String {
        let encode = |value: &str| url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();
        self.url_template
            .replace("{panel_id}", &encode(panel_id))
            .replace("{panel_type}", &encode(panel_type))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }

    pub fn focus_delay(&self) -> Duration {
        Duration::from_millis(self.focus_delay_ms)
    }
}
