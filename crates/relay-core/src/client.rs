//! Connected client handles and their outbound queues.
//!
//! A [`ClientHandle`] owns the only strong sender of its client's outbound
//! queue. Whoever holds the handle (the hub, once registered) decides when the
//! queue closes: dropping the handle closes it, exactly once. The session's
//! own reader enqueues direct replies through a [`Replier`], which does not
//! keep the queue open.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Generate a process-unique client ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Why a non-blocking enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity.
    #[error("Outbound queue full")]
    Full,

    /// The queue has been closed.
    #[error("Outbound queue closed")]
    Closed,
}

impl<T> From<mpsc::error::TrySendError<T>> for EnqueueError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        }
    }
}

/// A registered client, as seen by the hub.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    queue: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    /// Create a handle with a fresh ID and its outbound queue.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        Self::with_id(ClientId::generate(), capacity)
    }

    /// Create a handle with a specific ID and its outbound queue.
    #[must_use]
    pub fn with_id(id: ClientId, capacity: usize) -> (Self, OutboundQueue) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let handle = Self { id, queue };
        (handle, OutboundQueue { rx })
    }

    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Attempt to enqueue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the queue is at capacity, or
    /// [`EnqueueError::Closed`] if the writer has gone away.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), EnqueueError> {
        self.queue.try_send(payload).map_err(EnqueueError::from)
    }

    /// Create a replier that enqueues into this client's queue without
    /// keeping it open.
    #[must_use]
    pub fn replier(&self) -> Replier {
        Replier {
            id: self.id,
            queue: self.queue.downgrade(),
        }
    }
}

/// Direct-reply side of a client's outbound queue, held by the session reader.
#[derive(Debug, Clone)]
pub struct Replier {
    id: ClientId,
    queue: mpsc::WeakSender<Bytes>,
}

impl Replier {
    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Attempt to enqueue a reply without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Closed`] once the handle has been dropped, or
    /// [`EnqueueError::Full`] if the queue is at capacity.
    pub fn try_reply(&self, payload: Bytes) -> Result<(), EnqueueError> {
        let queue = self.queue.upgrade().ok_or(EnqueueError::Closed)?;
        queue.try_send(payload).map_err(EnqueueError::from)
    }
}

/// Consumer side of a client's outbound queue, drained by the session writer.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
}

impl OutboundQueue {
    /// Wait for the next payload.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Take a payload if one is pending.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
