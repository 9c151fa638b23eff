//! Line-based Chat Relay - Entry Point
//!
//! Loads configuration, binds the listener, and runs the accept loop until
//! the listener fails or Ctrl-C is received.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    // Config file from CHAT_RELAY_CONFIG, bind address from the command line
    let config = ServerConfig::load()?;

    let server = ChatServer::bind(config).await?;
    info!("Chat relay started on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}
