//! WebSocket transport implementation.
//!
//! This module adapts connections upgraded by axum to the transport traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::traits::{Connection, FrameSink, FrameSource, TransportError, WireFrame};

/// A WebSocket connection accepted through axum's upgrade extractor.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            socket,
            remote_addr,
        }
    }
}

impl Connection for WebSocketConnection {
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSource { stream }),
            Box::new(WebSocketSink { sink }),
        )
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(from_ws_message(message))),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        trace!(?frame, "Sending WebSocket frame");
        self.sink
            .send(into_ws_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

fn from_ws_message(message: Message) -> WireFrame {
    match message {
        Message::Text(text) => WireFrame::Text(Bytes::from(text)),
        Message::Binary(data) => WireFrame::Binary(Bytes::from(data)),
        Message::Ping(data) => WireFrame::Ping(Bytes::from(data)),
        Message::Pong(data) => WireFrame::Pong(Bytes::from(data)),
        Message::Close(_) => WireFrame::Close,
    }
}

fn into_ws_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        },
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        WireFrame::Ping(data) => Message::Ping(data.to_vec()),
        WireFrame::Pong(data) => Message::Pong(data.to_vec()),
        WireFrame::Close => Message::Close(None),
    }
}
