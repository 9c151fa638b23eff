//! Console client for the chat relay
//!
//! Sends a login line, prints every line the server relays, and forwards
//! stdin lines until the quit command, stdin EOF, or a lost connection.

use std::env;
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use chat_relay::config::DEFAULT_ADDR;
use chat_relay::{is_quit_command, Connection, DEFAULT_QUIT_COMMAND};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=warn")),
        )
        .init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let stream = TcpStream::connect(&addr).await?;
    let connection = Arc::new(Connection::new(stream, addr.clone()));
    println!("Connected to chat server at {}", addr);

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    // The first line sent is always the login
    print!("Enter your login: ");
    std::io::stdout().flush()?;
    let Some(login) = input.next_line().await? else {
        connection.close().await;
        return Ok(());
    };
    connection.set_identity(login.clone());
    if !connection.send(&login).await {
        println!("Connection to server lost");
        return Ok(());
    }
    println!(
        "Logged in as {}. Type a message (or '{}' to exit)",
        connection.display_name(),
        DEFAULT_QUIT_COMMAND
    );

    let reader = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(line) = connection.receive().await {
                println!("{}", line);
            }
        })
    };

    while let Some(line) = input.next_line().await? {
        if !connection.send(&line).await {
            println!("Connection to server lost");
            break;
        }
        if is_quit_command(&line, DEFAULT_QUIT_COMMAND) {
            break;
        }
    }

    connection.close().await;
    let _ = reader.await;

    Ok(())
}
