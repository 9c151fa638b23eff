//! Error types for the chat relay
//!
//! Defines application-level errors and line send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// None of these are fatal to the process except an `Io` error coming
/// from the listening endpoint, which ends the accept loop.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (listener bind/accept, config file read)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The registry actor has stopped and no longer accepts commands
    #[error("Registry closed")]
    RegistryClosed,
}

/// Line send errors
///
/// Reported by a connection's writer; callers of `Connection::send` only
/// see a boolean.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection has already been closed
    #[error("Connection closed")]
    Closed,

    /// The underlying stream rejected the write
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}
