//! Server configuration
//!
//! Defaults can be overridden by a JSON file named in `CHAT_RELAY_CONFIG`,
//! and the bind address by the first command-line argument.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;
use crate::message::DEFAULT_QUIT_COMMAND;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:4000";

/// Environment variable naming an optional JSON config file
pub const CONFIG_ENV_VAR: &str = "CHAT_RELAY_CONFIG";

/// Runtime settings for the relay server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: String,
    /// Line that ends a session (compared case-insensitively)
    pub quit_command: String,
    /// Pause after a transient accept failure, in milliseconds
    pub accept_backoff_ms: u64,
    /// Capacity of the registry command channel
    pub registry_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            quit_command: DEFAULT_QUIT_COMMAND.to_string(),
            accept_backoff_ms: 100,
            registry_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Parse a config from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Build the config from the environment and command line
    pub fn load() -> Result<Self, AppError> {
        let mut config = match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                debug!("Loading config from {:?}", path);
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        if let Some(addr) = env::args().nth(1) {
            config.bind_addr = addr;
        }

        Ok(config)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}
