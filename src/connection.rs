//! Connection struct definition
//!
//! Wraps one accepted stream and exposes line-oriented send/receive,
//! a write-once login identity, and idempotent close.

use std::fmt;
use std::sync::OnceLock;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::SendError;
use crate::types::ConnectionId;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Server-side handle to one peer's stream
///
/// Shared between the owning session (reads, final close) and any
/// broadcast that writes to it. Writes are serialized so lines from
/// different senders never interleave.
pub struct Connection {
    /// Unique identifier used for registry membership
    id: ConnectionId,
    /// Peer address, fixed at accept time
    remote_addr: String,
    /// Login identity (unset until the first line arrives)
    identity: OnceLock<String>,
    /// Read half; taken on close
    reader: Mutex<Option<BoxedReader>>,
    /// Write half; taken on close
    writer: Mutex<Option<BoxedWriter>>,
    /// Flips to true exactly once, waking any pending receive
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap a stream accepted from (or connected to) `remote_addr`
    pub fn new<S>(stream: S, remote_addr: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let (closed, _) = watch::channel(false);

        Self {
            id: ConnectionId::new(),
            remote_addr: remote_addr.into(),
            identity: OnceLock::new(),
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Login identity, if the handshake has completed
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Get the display name for this connection
    ///
    /// Returns the identity if set, otherwise "unknown".
    pub fn display_name(&self) -> &str {
        self.identity().unwrap_or("unknown")
    }

    /// Set the login identity
    ///
    /// Returns false if an identity was already set; the first one wins.
    pub fn set_identity(&self, identity: String) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one line to the peer
    ///
    /// Returns false on any failure, including a closed connection. The
    /// caller should treat the connection as dead.
    pub async fn send(&self, line: &str) -> bool {
        match self.write_line(line).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", self.id, e);
                false
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SendError::Closed)?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        writer.write_all(buf.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next line from the peer
    ///
    /// Returns `None` at end of stream, on a read error, or once the
    /// connection is closed. The line terminator is stripped and bytes that
    /// are not valid UTF-8 are replaced rather than ending the session.
    pub async fn receive(&self) -> Option<String> {
        if self.is_closed() {
            return None;
        }

        let mut closed = self.closed.subscribe();
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut()?;
        let mut buf = Vec::new();

        tokio::select! {
            biased;

            _ = closed.wait_for(|closed| *closed) => None,
            result = reader.read_until(b'\n', &mut buf) => match result {
                Ok(0) => {
                    debug!("Connection {} reached end of stream", self.id);
                    None
                }
                Ok(_) => {
                    if buf.ends_with(b"\n") {
                        buf.pop();
                        if buf.ends_with(b"\r") {
                            buf.pop();
                        }
                    }
                    Some(String::from_utf8_lossy(&buf).into_owned())
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", self.id, e);
                    None
                }
            },
        }
    }

    /// Close the connection
    ///
    /// Safe to call repeatedly and from several tasks; only the first call
    /// has any effect. Halves currently in use by another task are released
    /// when that task finishes with them.
    pub async fn close(&self) {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return;
        }

        if let Ok(mut guard) = self.writer.try_lock() {
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }
        if let Ok(mut guard) = self.reader.try_lock() {
            guard.take();
        }

        debug!("Connection {} ({}) closed", self.id, self.remote_addr);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("identity", &self.identity.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// In-memory connection plus the peer end of its stream
#[cfg(test)]
pub(crate) fn test_pair(remote_addr: &str) -> (std::sync::Arc<Connection>, BufReader<tokio::io::DuplexStream>) {
    let (local, peer) = tokio::io::duplex(4096);
    let connection = std::sync::Arc::new(Connection::new(local, remote_addr));
    (connection, BufReader::new(peer))
}

/// Read one line from a test peer, failing the test if nothing arrives
#[cfg(test)]
pub(crate) async fn read_peer_line(peer: &mut BufReader<tokio::io::DuplexStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(std::time::Duration::from_secs(2), peer.read_line(&mut line))
        .await
        .expect("timed out waiting for line")
        .expect("peer read failed");
    line
}
