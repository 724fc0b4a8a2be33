//! Client sessions.
//!
//! A session runs the protocol for one connection. Its reader decodes inbound
//! frames, answers `ping` directly and hands `broadcast` frames to the hub;
//! its writer drains the client's outbound queue to the wire and keeps the
//! connection alive with transport pings.
//!
//! State transitions:
//!
//! ```text
//! Connecting ──register──▶ Active ──error / timeout / close──▶ Closing ──both pumps done──▶ Closed
//! ```
//!
//! The two pumps share no cancellation signal other than the transport. When
//! the reader ends, the session unregisters, the hub drops the client's
//! handle, and the writer sees its queue close. A writer stuck on a peer that
//! stopped reading is aborted after `write_timeout`, which drops the write
//! half. When the writer ends, the read half of the transport is dropped,
//! which ends the reader.

use crate::client::{ClientHandle, ClientId, EnqueueError, OutboundQueue, Replier};
use crate::hub::{HubError, HubHandle};
use bytes::Bytes;
use relay_protocol::{FrameCodec, Message, ProtocolError, MAX_FRAME_SIZE};
use std::time::Duration;
use tenvis_relay_transport::{Connection, FrameSink, FrameSource, TransportError, WireFrame};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading from or writing to the transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer violated the protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No pong was observed within the idle timeout.
    #[error("No pong received within {0:?}")]
    IdleTimeout(Duration),

    /// The hub stopped.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// The writer task panicked or was cancelled.
    #[error("Writer task failed: {0}")]
    Writer(String),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for hub registration.
    Connecting,
    /// Registered and pumping frames.
    Active,
    /// One pump has ended; waiting for the other.
    Closing,
    /// Both pumps have ended.
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// How long to wait for a pong before giving up on the peer.
    pub idle_timeout: Duration,
    /// Longest a single write to the peer may take.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            queue_capacity: crate::client::DEFAULT_QUEUE_CAPACITY,
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// A client session bound to a hub.
pub struct Session {
    id: ClientId,
    hub: HubHandle,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create a session for a new connection.
    #[must_use]
    pub fn new(hub: HubHandle, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: ClientId::generate(),
            hub,
            config,
            state,
        }
    }

    /// Get the client ID this session registers under.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Watch the session's lifecycle state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        trace!(client = %self.id, state = ?next, "Session state");
        self.state.send_replace(next);
    }

    /// Run the session until the connection ends.
    ///
    /// Returns `Ok(())` when the connection was closed cleanly (peer close,
    /// peer gone, or queue closed by the hub) and the reason otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. Errors are local to this
    /// session and are never retried.
    pub async fn run(self, conn: Box<dyn Connection>) -> Result<(), SessionError> {
        let remote = conn.remote_addr();
        let (source, sink) = conn.split();
        let (handle, outbound) = ClientHandle::with_id(self.id, self.config.queue_capacity);
        let replier = handle.replier();

        if let Err(e) = self.hub.register(handle).await {
            warn!(client = %self.id, "Hub unavailable, dropping connection");
            self.transition(SessionState::Closed);
            return Err(e.into());
        }
        self.transition(SessionState::Active);
        debug!(client = %self.id, remote = ?remote, "Session active");

        let mut writer = tokio::spawn(write_pump(
            sink,
            outbound,
            self.config.ping_interval,
            self.config.write_timeout,
            self.id,
        ));
        let mut reader = Box::pin(read_pump(
            source,
            self.hub.clone(),
            replier,
            FrameCodec::new(self.config.max_frame_size),
            self.config.idle_timeout,
        ));

        let result = tokio::select! {
            res = &mut reader => {
                self.transition(SessionState::Closing);
                let _ = self.hub.unregister(self.id).await;
                // The hub has dropped the handle; the writer closes and exits.
                match time::timeout(self.config.write_timeout, &mut writer).await {
                    Ok(Ok(Err(e))) => debug!(client = %self.id, error = %e, "Writer ended with error"),
                    Ok(Err(e)) => warn!(client = %self.id, error = %e, "Writer task failed"),
                    Ok(Ok(Ok(()))) => {}
                    Err(_) => {
                        warn!(client = %self.id, "Writer stalled, closing transport");
                        writer.abort();
                        let _ = writer.await;
                    }
                }
                res
            }
            res = &mut writer => {
                self.transition(SessionState::Closing);
                drop(reader);
                let _ = self.hub.unregister(self.id).await;
                match res {
                    Ok(res) => res,
                    Err(e) => Err(SessionError::Writer(e.to_string())),
                }
            }
        };

        self.transition(SessionState::Closed);
        match &result {
            Ok(()) => debug!(client = %self.id, "Session closed"),
            Err(e) => debug!(client = %self.id, error = %e, "Session closed with error"),
        }
        result
    }
}

async fn read_pump(
    mut source: Box<dyn FrameSource>,
    hub: HubHandle,
    replier: Replier,
    codec: FrameCodec,
    idle_timeout: Duration,
) -> Result<(), SessionError> {
    let id = replier.id();
    let mut deadline = Instant::now() + idle_timeout;

    loop {
        let frame = match time::timeout_at(deadline, source.recv()).await {
            Err(_) => return Err(SessionError::IdleTimeout(idle_timeout)),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(frame))) => frame,
        };

        let data = match frame {
            WireFrame::Text(data) | WireFrame::Binary(data) => data,
            WireFrame::Pong(_) => {
                deadline = Instant::now() + idle_timeout;
                continue;
            }
            // Answered by the WebSocket layer.
            WireFrame::Ping(_) => continue,
            WireFrame::Close => {
                debug!(client = %id, "Received close frame");
                return Ok(());
            }
        };

        let message = match codec.decode(&data) {
            Ok(message) => message,
            Err(e) if e.is_fatal() => {
                warn!(client = %id, error = %e, "Closing session");
                return Err(e.into());
            }
            Err(e) => {
                debug!(client = %id, error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        match message {
            Message::Ping => {
                if !reply_pong(&hub, &replier, &codec).await? {
                    return Ok(());
                }
            }
            Message::Broadcast { raw } => {
                trace!(client = %id, bytes = raw.len(), "Broadcast");
                hub.broadcast(raw).await?;
            }
            Message::Pong { .. } => trace!(client = %id, "Ignoring client pong"),
            Message::Unknown { kind } => {
                debug!(client = %id, kind = %kind, "Unknown message type");
            }
        }
    }
}

/// Queue a pong for the sender. Returns `false` once the client is dropped.
async fn reply_pong(
    hub: &HubHandle,
    replier: &Replier,
    codec: &FrameCodec,
) -> Result<bool, SessionError> {
    let pong = codec.encode(&Message::pong_now())?;
    match replier.try_reply(pong) {
        Ok(()) => Ok(true),
        Err(EnqueueError::Full) => {
            warn!(client = %replier.id(), "Outbound queue full, dropping client");
            hub.unregister(replier.id()).await?;
            Ok(false)
        }
        // Already unregistered; the writer is shutting down.
        Err(EnqueueError::Closed) => Ok(false),
    }
}

async fn write_pump(
    mut sink: Box<dyn FrameSink>,
    mut outbound: OutboundQueue,
    ping_interval: Duration,
    write_timeout: Duration,
    id: ClientId,
) -> Result<(), SessionError> {
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            next = outbound.recv() => match next {
                Some(payload) => {
                    send_within(&mut sink, WireFrame::Text(payload), write_timeout).await?;
                }
                None => {
                    debug!(client = %id, "Outbound queue closed, sending close frame");
                    let _ = time::timeout(write_timeout, sink.close()).await;
                    return Ok(());
                }
            },

            _ = ticker.tick() => {
                trace!(client = %id, "Keepalive ping");
                send_within(&mut sink, WireFrame::Ping(Bytes::new()), write_timeout).await?;
            }
        }
    }
}

async fn send_within(
    sink: &mut Box<dyn FrameSink>,
    frame: WireFrame,
    limit: Duration,
) -> Result<(), TransportError> {
    time::timeout(limit, sink.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
}
