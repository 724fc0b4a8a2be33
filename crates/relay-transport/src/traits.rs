//! Transport abstraction traits for Relay.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing sessions to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A single transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 data frame.
    Text(Bytes),
    /// Binary data frame.
    Binary(Bytes),
    /// Transport keepalive ping.
    Ping(Bytes),
    /// Transport keepalive pong.
    Pong(Bytes),
    /// Orderly close.
    Close,
}

impl WireFrame {
    /// Create a text frame.
    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        WireFrame::Text(data.into())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete in time.
    #[error("Write timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has gone away cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Send an orderly close frame.
    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(WireFrame::Close).await
    }
}

/// An accepted connection, ready to be split into its two halves.
///
/// Dropping both halves closes the underlying transport.
pub trait Connection: Send {
    /// Split into independent read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
