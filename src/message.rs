//! Line protocol definitions
//!
//! Plain text, one message per newline-terminated line. The server formats
//! notices for broadcast; there are no structured fields on the wire.

use std::fmt;

/// Line that ends a session when it is not the login line
pub const DEFAULT_QUIT_COMMAND: &str = "quit";

/// Server-generated notice broadcast to other connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A connection completed its login
    LoggedIn { identity: String },
    /// A chat line tagged with the sender's identity
    Chat { from: String, content: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::LoggedIn { identity } => write!(f, "{} logged in.", identity),
            Notice::Chat { from, content } => write!(f, "{} says: {}", from, content),
        }
    }
}

/// Check whether a received line is the disconnect command
pub fn is_quit_command(line: &str, quit_command: &str) -> bool {
    line.to_lowercase() == quit_command.to_lowercase()
}
