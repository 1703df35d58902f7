use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dto::envelope::Envelope;

/// Frames accepted from a hub WebSocket client.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubInbound {
    /// Start receiving envelopes of `channel`.
    Join { channel: String },
    /// Stop receiving envelopes of `channel`.
    Leave { channel: String },
    /// Publish an event; only device events are accepted.
    Publish {
        channel: String,
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl HubInbound {
    /// Parse a text frame.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Frames sent to a hub WebSocket client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubOutbound {
    /// The socket now receives envelopes of `channel`.
    Joined { channel: String },
    /// A channel envelope.
    Envelope(Envelope),
    /// A frame was refused.
    Error { message: String },
}
