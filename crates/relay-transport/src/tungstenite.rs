//! WebSocket transport over `tokio-tungstenite`.
//!
//! Wraps any [`WebSocketStream`], so the same adapter serves sockets accepted
//! from a plain [`TcpListener`](tokio::net::TcpListener) and streams dialed
//! with `connect_async`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, trace};

use crate::traits::{Connection, FrameSink, FrameSource, TransportError, WireFrame};

/// A WebSocket connection driven by tokio-tungstenite.
pub struct TungsteniteConnection<S> {
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
}

impl<S> TungsteniteConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            remote_addr,
        }
    }
}

impl TungsteniteConnection<TcpStream> {
    /// Run the server side of the WebSocket handshake on an accepted socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the peer address is unavailable and
    /// [`TransportError::ReceiveFailed`] if the handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let remote_addr = stream.peer_addr()?;
        let ws = accept_async(stream).await.map_err(|e| {
            TransportError::ReceiveFailed(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!(remote = %remote_addr, "WebSocket handshake completed");
        Ok(Self::new(ws, Some(remote_addr)))
    }
}

impl<S> Connection for TungsteniteConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(TungsteniteSource { stream }),
            Box::new(TungsteniteSink { sink }),
        )
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Read half of a [`TungsteniteConnection`].
pub struct TungsteniteSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => {
                    if let Some(frame) = from_ws_message(message) {
                        return Ok(Some(frame));
                    }
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

/// Write half of a [`TungsteniteConnection`].
pub struct TungsteniteSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        trace!(?frame, "Sending WebSocket frame");
        self.sink
            .send(into_ws_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

// Raw frames are only produced when writing, never by the reader.
fn from_ws_message(message: Message) -> Option<WireFrame> {
    let frame = match message {
        Message::Text(text) => WireFrame::Text(Bytes::from(text)),
        Message::Binary(data) => WireFrame::Binary(Bytes::from(data)),
        Message::Ping(data) => WireFrame::Ping(Bytes::from(data)),
        Message::Pong(data) => WireFrame::Pong(Bytes::from(data)),
        Message::Close(_) => WireFrame::Close,
        Message::Frame(_) => return None,
    };
    Some(frame)
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_message_mapping() {
        assert_eq!(
            from_ws_message(Message::Text("hi".into())),
            Some(WireFrame::text("hi"))
        );
        assert_eq!(
            from_ws_message(Message::Close(None)),
            Some(WireFrame::Close)
        );
        assert_eq!(
            into_ws_message(WireFrame::Text(Bytes::from_static(&[0xff]))),
            Message::Binary(vec![0xff])
        );
    }

    #[tokio::test]
    async fn test_accept_and_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TungsteniteConnection::accept(stream).await.unwrap();
            assert!(conn.remote_addr().is_some());

            let (mut source, mut sink) = Box::new(conn).split();
            assert_eq!(source.recv().await.unwrap(), Some(WireFrame::text("hello")));
            sink.send(WireFrame::text("world")).await.unwrap();
            sink.close().await.unwrap();
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        client.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("world".into())
        );
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Message::Close(_)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_hangup_ends_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TungsteniteConnection::accept(stream).await.unwrap();
            let (mut source, _sink) = Box::new(conn).split();
            source.recv().await
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        drop(client);

        // A reset without a close handshake may surface as an error instead.
        match server.await.unwrap() {
            Ok(None) | Err(_) => {}
            Ok(Some(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }
}
