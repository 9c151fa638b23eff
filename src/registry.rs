//! Client Registry actor
//!
//! Owns the set of live connections. Session tasks and broadcasts talk to it
//! through a cloneable `RegistryHandle`; every structural change and every
//! snapshot is processed one at a time by the actor, so a broadcast always
//! iterates a consistent point-in-time copy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::AppError;
use crate::types::ConnectionId;

/// Commands sent from handles to the Registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a connection; replies false if it is already present
    Add {
        connection: Arc<Connection>,
        reply: oneshot::Sender<bool>,
    },
    /// Remove a connection; replies false if it was already gone
    Remove {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    /// Copy out every connection except `excluding`
    Snapshot {
        excluding: Option<ConnectionId>,
        reply: oneshot::Sender<Vec<Arc<Connection>>>,
    },
    /// Number of registered connections
    Count { reply: oneshot::Sender<usize> },
}

/// The Registry actor
///
/// Holds a shared reference to each connection; the owning session keeps
/// the lifecycle and performs the final close.
pub struct Registry {
    /// All live connections: ConnectionId -> Connection
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl Registry {
    /// Create a new Registry with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            connections: HashMap::new(),
            receiver,
        }
    }

    /// Run the Registry event loop
    ///
    /// Processes commands until every handle has been dropped.
    pub async fn run(mut self) {
        debug!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("Registry shutting down");
    }

    /// Process a single command
    ///
    /// A dropped reply receiver means the caller gave up; the command
    /// still takes effect.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Add { connection, reply } => {
                let _ = reply.send(self.handle_add(connection));
            }
            RegistryCommand::Remove { id, reply } => {
                let _ = reply.send(self.handle_remove(id));
            }
            RegistryCommand::Snapshot { excluding, reply } => {
                let targets = self
                    .connections
                    .values()
                    .filter(|c| Some(c.id()) != excluding)
                    .cloned()
                    .collect();
                let _ = reply.send(targets);
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn handle_add(&mut self, connection: Arc<Connection>) -> bool {
        let id = connection.id();
        if self.connections.contains_key(&id) {
            return false;
        }

        info!("Connection {} from {} registered", id, connection.remote_addr());
        self.connections.insert(id, connection);
        debug!("Total connections: {}", self.connections.len());
        true
    }

    fn handle_remove(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(&id) else {
            return false;
        };

        info!(
            "Connection {} ({}) unregistered",
            id,
            connection.display_name()
        );
        debug!("Total connections: {}", self.connections.len());
        true
    }
}

/// Cloneable handle to a running Registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Start a Registry actor and return a handle to it
    pub fn spawn(buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        tokio::spawn(Registry::new(receiver).run());
        Self { sender }
    }

    /// Wrap an existing command channel
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Register a connection
    ///
    /// Returns `Ok(false)` if the connection is already registered.
    pub async fn add(&self, connection: Arc<Connection>) -> Result<bool, AppError> {
        self.request(|reply| RegistryCommand::Add { connection, reply })
            .await
    }

    /// Remove a connection
    ///
    /// Returns `Ok(false)` if it was not registered; absence is not an error.
    pub async fn remove(&self, id: ConnectionId) -> Result<bool, AppError> {
        self.request(|reply| RegistryCommand::Remove { id, reply })
            .await
    }

    /// Point-in-time list of every registered connection except `excluding`
    pub async fn snapshot_broadcast_targets(
        &self,
        excluding: ConnectionId,
    ) -> Result<Vec<Arc<Connection>>, AppError> {
        self.request(|reply| RegistryCommand::Snapshot {
            excluding: Some(excluding),
            reply,
        })
        .await
    }

    /// Point-in-time list of every registered connection
    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Result<Vec<Arc<Connection>>, AppError> {
        self.request(|reply| RegistryCommand::Snapshot {
            excluding: None,
            reply,
        })
        .await
    }

    /// Number of registered connections
    #[cfg(test)]
    pub(crate) async fn len(&self) -> Result<usize, AppError> {
        self.request(|reply| RegistryCommand::Count { reply }).await
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.len().await? == 0)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, AppError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| AppError::RegistryClosed)?;
        response.await.map_err(|_| AppError::RegistryClosed)
    }
}
