//! The hub: registry of connected clients and broadcast fan-out.
//!
//! The registry is owned by a single worker task that applies register,
//! unregister, and broadcast commands one at a time in arrival order. Nothing
//! else touches the registry, so it needs no lock. Fan-out only ever uses
//! non-blocking enqueues: a client whose queue is full is dropped from the
//! registry instead of stalling the broadcast.

use crate::client::{ClientHandle, ClientId, EnqueueError};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    /// The hub worker has stopped.
    #[error("Hub is closed")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command queue feeding the hub worker.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of registered clients.
    pub clients: usize,
    /// Broadcasts applied since start.
    pub broadcasts: u64,
    /// Total enqueues performed by broadcasts.
    pub deliveries: u64,
    /// Clients dropped because their queue was full.
    pub evictions: u64,
}

enum Command {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Bytes),
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// Submission side of the hub. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register(handle) => write!(f, "Register({})", handle.id()),
            Command::Unregister(id) => write!(f, "Unregister({})", id),
            Command::Broadcast(payload) => write!(f, "Broadcast({} bytes)", payload.len()),
            Command::Stats(_) => f.write_str("Stats"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl HubHandle {
    async fn submit(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Add a client to the registry.
    ///
    /// Each handle must be registered at most once.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped. The handle is
    /// dropped, closing its queue.
    pub async fn register(&self, handle: ClientHandle) -> Result<(), HubError> {
        self.submit(Command::Register(handle)).await
    }

    /// Remove a client and close its queue. Removing an absent client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.submit(Command::Unregister(id)).await
    }

    /// Deliver a payload to every client registered when the hub applies it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<(), HubError> {
        self.submit(Command::Broadcast(payload.into())).await
    }

    /// Get hub statistics, ordered after every command submitted before it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Get the number of registered clients.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn client_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.clients)
    }

    /// Stop the hub, closing every registered client's queue.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has already stopped.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.submit(Command::Shutdown).await
    }

    /// Whether the hub worker has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The hub worker.
pub struct Hub {
    clients: HashMap<ClientId, ClientHandle>,
    commands: mpsc::Receiver<Command>,
    stats: HubStats,
}

impl Hub {
    /// Create a hub and its submission handle.
    ///
    /// The hub does nothing until [`Hub::run`] is polled.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Self {
            clients: HashMap::new(),
            commands: rx,
            stats: HubStats::default(),
        };
        (hub, HubHandle { commands: tx })
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process commands until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(command) = self.commands.recv().await {
            trace!(?command, "Applying hub command");
            if !self.apply(command) {
                break;
            }
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!(clients = remaining, "Hub stopped");
    }

    /// Apply one command. Returns `false` when the hub should stop.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Register(handle) => {
                let id = handle.id();
                self.clients.insert(id, handle);
                debug!(client = %id, clients = self.clients.len(), "Client registered");
            }
            Command::Unregister(id) => {
                // Dropping the handle closes the queue.
                if self.clients.remove(&id).is_some() {
                    debug!(client = %id, clients = self.clients.len(), "Client unregistered");
                }
            }
            Command::Broadcast(payload) => self.fan_out(payload),
            Command::Stats(reply) => {
                let _ = reply.send(HubStats {
                    clients: self.clients.len(),
                    ..self.stats
                });
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn fan_out(&mut self, payload: Bytes) {
        let mut delivered = 0u64;
        let mut evicted = 0u64;

        self.clients
            .retain(|id, client| match client.try_deliver(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(EnqueueError::Full) => {
                    warn!(client = %id, "Outbound queue full, dropping client");
                    evicted += 1;
                    false
                }
                Err(EnqueueError::Closed) => {
                    debug!(client = %id, "Outbound queue closed, dropping client");
                    false
                }
            });

        self.stats.broadcasts += 1;
        self.stats.deliveries += delivered;
        self.stats.evictions += evicted;
        trace!(
            bytes = payload.len(),
            recipients = delivered,
            evicted,
            "Broadcast applied"
        );
    }
}
