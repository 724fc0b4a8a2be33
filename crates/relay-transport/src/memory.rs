//! In-memory transport.
//!
//! A [`MemoryConnection`] and its [`MemoryPeer`] are two ends of a duplex
//! pipe. The connection end is handed to the server like any accepted socket;
//! the peer end plays the remote client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{Connection, FrameSink, FrameSource, TransportError, WireFrame};

/// Default per-direction buffer of a memory pipe.
const DEFAULT_BUFFER: usize = 1024;

/// Create a connected pair with the default buffer size.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    pair_with_buffer(DEFAULT_BUFFER)
}

/// Create a connected pair buffering up to `buffer` frames per direction.
#[must_use]
pub fn pair_with_buffer(buffer: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(buffer);
    let (to_peer, from_server) = mpsc::channel(buffer);

    let conn = MemoryConnection {
        inbound: from_peer,
        outbound: to_peer,
    };
    let peer = MemoryPeer {
        outbound: to_server,
        inbound: from_server,
    };
    (conn, peer)
}

/// Server side of an in-memory pipe.
pub struct MemoryConnection {
    inbound: mpsc::Receiver<Result<WireFrame, TransportError>>,
    outbound: mpsc::Sender<WireFrame>,
}

impl Connection for MemoryConnection {
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (
            Box::new(MemorySource {
                inbound: self.inbound,
            }),
            Box::new(MemorySink {
                outbound: self.outbound,
            }),
        )
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

struct MemorySource {
    inbound: mpsc::Receiver<Result<WireFrame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct MemorySink {
    outbound: mpsc::Sender<WireFrame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Remote end of an in-memory pipe.
pub struct MemoryPeer {
    outbound: mpsc::Sender<Result<WireFrame, TransportError>>,
    inbound: mpsc::Receiver<WireFrame>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server dropped its read half.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        self.outbound
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server dropped its read half.
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(WireFrame::text(text.to_string())).await
    }

    /// Make the server's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server dropped its read half.
    pub async fn inject_error(&self, error: TransportError) -> Result<(), TransportError> {
        self.outbound
            .send(Err(error))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the server dropped its write half.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.inbound.recv().await
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.inbound.try_recv().ok()
    }

    /// Whether the server has dropped its read half.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
