//! PopOutMessage - the envelope exchanged between primary and pop-out windows

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChannelError;
use crate::options::OptionsCacheSnapshot;
use crate::resource::{ForwardedChange, ResourceState};

/// Message kinds understood by both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PopOutMessageType {
    /// Pop-out is listening and wants a snapshot
    PanelReady,
    /// Full state snapshot from the primary
    StateUpdate,
    /// Primary asks the pop-out to close
    ClosePanel,
    /// Pop-out asks the primary to change the location
    ChangeParams,
    /// Pop-out asks the primary to re-fetch
    Refresh,
    Ping,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `{type, payload?, timestamp}`; the timestamp defaults to now when absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopOutMessage {
    #[serde(rename = "type")]
    pub kind: PopOutMessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

/// Payload of a `STATE_UPDATE` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotPayload<F, D, S> {
    pub state: ResourceState<F, D, S>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_options_cache: Option<OptionsCacheSnapshot>,
}

impl PopOutMessage {
    pub fn new(kind: PopOutMessageType) -> Self {
        Self {
            kind,
            payload: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_payload(kind: PopOutMessageType, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(kind)
        }
    }

    /// Snapshot message carrying `state` and, optionally, raw option payloads
    pub fn state_update<F, D, S>(
        state: &ResourceState<F, D, S>,
        options: Option<&OptionsCacheSnapshot>,
    ) -> Result<Self, ChannelError>
    where
        F: Serialize,
        D: Serialize,
        S: Serialize,
    {
        let mut payload = serde_json::Map::new();
        payload.insert("state".to_string(), serde_json::to_value(state)?);
        if let Some(options) = options {
            payload.insert("filterOptionsCache".to_string(), serde_json::to_value(options)?);
        }
        Ok(Self::with_payload(PopOutMessageType::StateUpdate, Value::Object(payload)))
    }

    /// Message asking the primary to perform `change`
    pub fn forwarded(change: &ForwardedChange) -> Result<Self, ChannelError> {
        Ok(match change {
            ForwardedChange::Refresh => Self::new(PopOutMessageType::Refresh),
            other => Self::with_payload(PopOutMessageType::ChangeParams, serde_json::to_value(other)?),
        })
    }

    /// The change a `CHANGE_PARAMS` or `REFRESH` message carries
    pub fn to_forwarded(&self) -> Result<Option<ForwardedChange>, ChannelError> {
        match self.kind {
            PopOutMessageType::Refresh => Ok(Some(ForwardedChange::Refresh)),
            PopOutMessageType::ChangeParams => self.decode_payload().map(Some),
            _ => Ok(None),
        }
    }

    /// Decode a `STATE_UPDATE` payload
    pub fn to_snapshot<F, D, S>(&self) -> Result<StateSnapshotPayload<F, D, S>, ChannelError>
    where
        F: DeserializeOwned,
        D: DeserializeOwned,
        S: DeserializeOwned,
    {
        self.decode_payload()
    }

    fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        let payload = self.payload.clone().ok_or(ChannelError::MissingPayload(self.kind))?;
        Ok(serde_json::from_value(payload)?)
    }
}
