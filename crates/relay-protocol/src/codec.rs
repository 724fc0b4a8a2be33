//! Codec for encoding and decoding Relay frames.
//!
//! This module provides JSON envelope serialization with a frame size limit.

use bytes::Bytes;
use thiserror::Error;

use crate::message::{Envelope, Message, MessageType};

/// Maximum frame size (512 KiB).
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the maximum size. Fatal to the connection.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Frame is not a valid JSON envelope. The frame is dropped.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Whether the connection must be closed after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}

/// Encode a message with the default codec.
///
/// # Errors
///
/// Returns an error if JSON encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(message)
}

/// Decode a frame with the default codec.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a JSON envelope.
pub fn decode(data: &Bytes) -> Result<Message, ProtocolError> {
    FrameCodec::default().decode(data)
}

/// Codec with a configurable frame size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Reject frames over the size limit.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if `len` exceeds the limit.
    pub fn check_size(&self, len: usize) -> Result<(), ProtocolError> {
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Decode a frame into a message.
    ///
    /// Broadcasts keep the frame bytes untouched so they can be relayed as
    /// received.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or not a JSON envelope.
    pub fn decode(&self, data: &Bytes) -> Result<Message, ProtocolError> {
        self.check_size(data.len())?;

        let envelope: Envelope = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;

        let message = match MessageType::from_wire(&envelope.kind) {
            Some(MessageType::Ping) => Message::Ping,
            Some(MessageType::Broadcast) => Message::Broadcast { raw: data.clone() },
            Some(MessageType::Pong) => Message::Pong {
                timestamp: envelope.payload.as_i64().unwrap_or_default(),
            },
            None => Message::Unknown {
                kind: envelope.kind,
            },
        };

        Ok(message)
    }

    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let envelope = match message {
            Message::Broadcast { raw } => return Ok(raw.clone()),
            Message::Ping => Envelope::new(MessageType::Ping.as_str(), serde_json::Value::Null),
            Message::Pong { timestamp } => {
                Envelope::new(MessageType::Pong.as_str(), serde_json::json!(timestamp))
            }
            Message::Unknown { kind } => Envelope::new(kind.clone(), serde_json::Value::Null),
        };

        let data = serde_json::to_vec(&envelope).map_err(ProtocolError::Encode)?;
        Ok(Bytes::from(data))
    }
}
