//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identity of one accepted connection

use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Registry membership is keyed by this value, not by login name, so two
/// connections may log in with the same identity without conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
