//! Line-based Chat Relay Library
//!
//! A minimal TCP chat relay built on tokio. Clients send a login line, then
//! newline-delimited messages; the server fans each message out to every
//! other connected client.
//!
//! # Features
//! - Plain-text line protocol, first line is the login identity
//! - Broadcast to everyone except the sender
//! - Case-insensitive quit command
//! - Eviction of clients whose socket can no longer be written
//!
//! # Architecture
//! - `Registry` is an actor owning the set of live connections
//! - Each connection has a `Session` task driving its login handshake and
//!   message loop
//! - `Dispatcher` snapshots the registry and sends to each target without
//!   holding any lock during the writes
//!
//! # Example
//! ```ignore
//! use chat_relay::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(ServerConfig::default()).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use error::{AppError, SendError};
pub use message::{is_quit_command, Notice, DEFAULT_QUIT_COMMAND};
pub use registry::{Registry, RegistryCommand, RegistryHandle};
pub use server::{accept_loop, Acceptor, ChatServer};
pub use session::{Session, SessionState};
pub use types::ConnectionId;
