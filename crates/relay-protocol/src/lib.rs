//! # relay-protocol
//!
//! Wire protocol definitions for the Relay messaging gateway.
//!
//! Every frame on the wire is a JSON envelope:
//!
//! ```json
//! {"type": "broadcast", "payload": {"text": "hello"}}
//! ```
//!
//! ## Message Types
//!
//! - `ping` - Application-level liveness check, answered with `pong`
//! - `pong` - Server reply carrying the current unix time in seconds
//! - `broadcast` - Relayed verbatim to every connected client
//!
//! Any other `type` decodes to [`Message::Unknown`] and is ignored by the server.
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use relay_protocol::{codec, Message};
//!
//! let frame = Bytes::from_static(br#"{"type":"broadcast","payload":"hi"}"#);
//! let message = codec::decode(&frame).unwrap();
//! assert!(matches!(message, Message::Broadcast { .. }));
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use message::{unix_timestamp, Envelope, Message, MessageType};
