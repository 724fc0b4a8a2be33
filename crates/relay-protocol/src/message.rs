//! Message types for the Relay protocol.
//!
//! Frames arrive as a loosely typed JSON [`Envelope`] and are classified into
//! a [`Message`] by the codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Known message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    Broadcast,
}

impl MessageType {
    /// The `type` string used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Broadcast => "broadcast",
        }
    }

    /// Look up a wire `type` string.
    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "broadcast" => Some(MessageType::Broadcast),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope every frame is wrapped in.
///
/// Both fields are optional on input: a missing `type` is treated as the
/// empty string and a missing `payload` as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client liveness check. The payload is ignored.
    Ping,

    /// Reply to a [`Message::Ping`].
    Pong {
        /// Unix time in seconds at which the pong was produced.
        timestamp: i64,
    },

    /// A message to relay to every connected client.
    Broadcast {
        /// The complete frame exactly as received.
        raw: Bytes,
    },

    /// A well-formed envelope with an unrecognized type.
    Unknown {
        /// The unrecognized `type` value.
        kind: String,
    },
}

impl Message {
    /// Create a pong stamped with the current time.
    #[must_use]
    pub fn pong_now() -> Self {
        Message::Pong {
            timestamp: unix_timestamp(),
        }
    }

    /// Create a broadcast message wrapping a raw frame.
    #[must_use]
    pub fn broadcast(raw: impl Into<Bytes>) -> Self {
        Message::Broadcast { raw: raw.into() }
    }
}
