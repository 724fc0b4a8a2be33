//! # relay-transport
//!
//! Transport abstraction layer for the Relay messaging gateway.
//!
//! A [`Connection`] is split into a [`FrameSource`] and a [`FrameSink`] so that
//! a session can read and write concurrently from two independent tasks:
//!
//! - **WebSocket** - Connections upgraded by axum
//! - **Tungstenite** - Any `tokio-tungstenite` stream, accepted or dialed
//! - **Memory** - In-process duplex pair, used to drive sessions in tests
//!
//! ```rust,ignore
//! use tenvis_relay_transport::Connection;
//!
//! async fn pump(conn: Box<dyn Connection>) {
//!     let (mut source, mut sink) = conn.split();
//!     while let Ok(Some(frame)) = source.recv().await {
//!         if sink.send(frame).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "tungstenite")]
pub mod tungstenite;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, FrameSink, FrameSource, TransportError, WireFrame};

#[cfg(feature = "tungstenite")]
pub use tungstenite::TungsteniteConnection;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
