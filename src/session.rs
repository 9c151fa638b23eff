//! Per-connection session handler
//!
//! Drives one connection through `AwaitingLogin -> Active -> Closed`:
//! the first line is the login identity, every later line is tagged and
//! broadcast, and the quit command or end of stream ends the session.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::message::{is_quit_command, Notice};
use crate::registry::RegistryHandle;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first line, which becomes the identity
    AwaitingLogin,
    /// Logged in; relaying lines
    Active,
    /// Finished; connection closed and unregistered
    Closed,
}

/// Handler for one connection
pub struct Session {
    connection: Arc<Connection>,
    registry: RegistryHandle,
    dispatcher: Dispatcher,
    quit_command: String,
    state: SessionState,
}

impl Session {
    pub fn new(
        connection: Arc<Connection>,
        registry: RegistryHandle,
        dispatcher: Dispatcher,
        quit_command: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            registry,
            dispatcher,
            quit_command: quit_command.into(),
            state: SessionState::AwaitingLogin,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion
    ///
    /// The connection is closed and unregistered on every exit path,
    /// including a panic inside the message loop.
    pub async fn run(mut self) -> SessionState {
        let outcome = AssertUnwindSafe(self.drive()).catch_unwind().await;
        if outcome.is_err() {
            error!(
                "Session for connection {} panicked; cleaning up",
                self.connection.id()
            );
        }

        self.finish().await;
        self.state
    }

    async fn drive(&mut self) {
        while self.state != SessionState::Closed {
            self.state = self.step().await;
        }
    }

    /// Perform one state transition
    async fn step(&mut self) -> SessionState {
        match self.state {
            SessionState::AwaitingLogin => self.await_login().await,
            SessionState::Active => self.relay_next().await,
            SessionState::Closed => SessionState::Closed,
        }
    }

    async fn await_login(&self) -> SessionState {
        let Some(identity) = self.connection.receive().await else {
            debug!(
                "Connection {} ended before login",
                self.connection.id()
            );
            return SessionState::Closed;
        };

        if !self.connection.set_identity(identity.clone()) {
            warn!(
                "Connection {} already had an identity",
                self.connection.id()
            );
        }
        info!(
            "Client {} logged in as '{}'",
            self.connection.remote_addr(),
            self.connection.display_name()
        );

        let notice = Notice::LoggedIn { identity };
        self.dispatcher
            .broadcast(&self.connection, &notice.to_string())
            .await;

        SessionState::Active
    }

    async fn relay_next(&self) -> SessionState {
        let Some(line) = self.connection.receive().await else {
            return SessionState::Closed;
        };

        if is_quit_command(&line, &self.quit_command) {
            info!("{} sent the quit command", self.connection.display_name());
            return SessionState::Closed;
        }

        debug!(
            "Message received from {}: {}",
            self.connection.display_name(),
            line
        );

        let notice = Notice::Chat {
            from: self.connection.display_name().to_string(),
            content: line,
        };
        self.dispatcher
            .broadcast(&self.connection, &notice.to_string())
            .await;

        SessionState::Active
    }

    async fn finish(&mut self) {
        self.state = SessionState::Closed;
        self.connection.close().await;

        match self.registry.remove(self.connection.id()).await {
            Ok(true) => {}
            Ok(false) => debug!(
                "Connection {} was already unregistered",
                self.connection.id()
            ),
            Err(e) => warn!(
                "Could not unregister connection {}: {}",
                self.connection.id(),
                e
            ),
        }

        info!(
            "Client {} ({}) disconnected",
            self.connection.remote_addr(),
            self.connection.display_name()
        );
    }
}
