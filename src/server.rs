//! ChatServer accept loop
//!
//! Binds the listening endpoint, registers every accepted stream with the
//! Registry actor, and spawns one Session task per connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::registry::RegistryHandle;
use crate::session::{Session, SessionState};

/// Source of accepted streams for the accept loop
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// The relay server
///
/// Owns the listener and the registry handle shared by all sessions.
pub struct ChatServer {
    listener: TcpListener,
    registry: RegistryHandle,
    config: ServerConfig,
}

impl ChatServer {
    /// Bind to `config.bind_addr` and start the Registry actor
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self::from_listener(listener, config))
    }

    /// Build a server around an already bound listener
    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = RegistryHandle::spawn(config.registry_buffer);
        Self {
            listener,
            registry,
            config,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Run the accept loop until the listener fails
    pub async fn run(self) -> Result<(), AppError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Chat relay listening on {}", addr);
        }
        accept_loop(self.listener, self.registry, self.config).await
    }
}

/// Accept connections and spawn a session for each
///
/// Transient accept failures are logged and the loop continues. Any other
/// failure ends the loop: the acceptor is closed, live sessions are left
/// to finish on their own, and the error is returned once they have.
pub async fn accept_loop<A: Acceptor>(
    mut acceptor: A,
    registry: RegistryHandle,
    config: ServerConfig,
) -> Result<(), AppError> {
    let dispatcher = Dispatcher::new(registry.clone());
    let mut sessions = JoinSet::new();

    let failure = loop {
        debug!("Waiting for a new client connection");

        match acceptor.accept().await {
            Ok((stream, addr)) => {
                info!("Client {} connected", addr);
                if let Some(session) = admit(stream, addr, &registry, &dispatcher, &config).await {
                    sessions.spawn(session.run());
                }
            }
            Err(e) if is_transient_accept_error(&e) => {
                warn!("Failed to accept connection, server may be overloaded: {}", e);
                tokio::time::sleep(config.accept_backoff()).await;
            }
            Err(e) => {
                error!("Listener failed: {}", e);
                break e;
            }
        }

        reap_finished(&mut sessions);
    };

    info!("Shutting down server");
    drop(acceptor);

    if !sessions.is_empty() {
        info!("Waiting for {} active sessions to finish", sessions.len());
    }
    while let Some(result) = sessions.join_next().await {
        if let Err(e) = result {
            error!("Session task failed: {}", e);
        }
    }

    Err(AppError::Io(failure))
}

/// Register a freshly accepted stream and build its session
///
/// A connection that cannot be admitted is closed immediately; the server
/// keeps running.
async fn admit<S>(
    stream: S,
    addr: SocketAddr,
    registry: &RegistryHandle,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
) -> Option<Session>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection = Arc::new(Connection::new(stream, addr.to_string()));

    match registry.add(Arc::clone(&connection)).await {
        Ok(true) => Some(Session::new(
            connection,
            registry.clone(),
            dispatcher.clone(),
            config.quit_command.clone(),
        )),
        Ok(false) => {
            warn!("Connection {} was already registered; closing", connection.id());
            connection.close().await;
            None
        }
        Err(e) => {
            error!("Could not admit client {}, closing connection: {}", addr, e);
            connection.close().await;
            None
        }
    }
}

fn reap_finished(sessions: &mut JoinSet<SessionState>) {
    while let Some(result) = sessions.try_join_next() {
        if let Err(e) = result {
            error!("Session task failed: {}", e);
        }
    }
}

/// Whether an accept error leaves the listener usable
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || is_fd_exhaustion(err)
}

/// Per-process or system-wide open file limit reached
#[cfg(unix)]
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::join_all;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::sync::mpsc;

    use super::*;

    /// Acceptor fed from a channel; a closed channel acts as a failed listener
    struct ScriptedAcceptor {
        events: mpsc::Receiver<io::Result<(DuplexStream, SocketAddr)>>,
    }

    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        fn accept(&mut self) -> impl Future<Output = io::Result<(DuplexStream, SocketAddr)>> + Send {
            async move {
                match self.events.recv().await {
                    Some(event) => event,
                    None => Err(io::Error::from(io::ErrorKind::InvalidInput)),
                }
            }
        }
    }

    fn closed_registry() -> RegistryHandle {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        RegistryHandle::new(tx)
    }

    async fn expect_eof(reader: &mut BufReader<OwnedReadHalf>) {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for end of stream")
            .expect("read failed");
        assert_eq!(n, 0);
    }

    /// Next relayed chat line, skipping login notices
    async fn next_chat_line(reader: &mut BufReader<OwnedReadHalf>, wait: Duration) -> Option<String> {
        loop {
            let mut line = String::new();
            match tokio::time::timeout(wait, reader.read_line(&mut line)).await {
                Err(_) | Ok(Ok(0)) => return None,
                Ok(Ok(_)) if line.ends_with(" logged in.\n") => continue,
                Ok(Ok(_)) => return Some(line),
                Ok(Err(e)) => panic!("read failed: {}", e),
            }
        }
    }

    async fn wait_for_logins(registry: &RegistryHandle, count: usize) {
        for _ in 0..200 {
            let snapshot = registry.snapshot().await.unwrap();
            if snapshot.len() == count && snapshot.iter().all(|c| c.identity().is_some()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} clients never finished logging in", count);
    }

    async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for line")
            .expect("read failed");
        line
    }

    async fn wait_for_clients(registry: &RegistryHandle, count: usize) {
        for _ in 0..200 {
            if registry.len().await.unwrap() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {} clients", count);
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test]
    fn test_fatal_accept_errors() {
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_relay_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ChatServer::from_listener(listener, ServerConfig::default());
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());

        let (bob_read, mut bob_write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut bob_read = BufReader::new(bob_read);
        bob_write.write_all(b"bob\n").await.unwrap();
        wait_for_clients(&registry, 1).await;

        let (alice_read, mut alice_write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut alice_read = BufReader::new(alice_read);
        wait_for_clients(&registry, 2).await;

        alice_write.write_all(b"alice\nhello\n").await.unwrap();
        assert_eq!(read_line(&mut bob_read).await, "alice logged in.\n");
        assert_eq!(read_line(&mut bob_read).await, "alice says: hello\n");

        bob_write.write_all(b"hi alice\n").await.unwrap();
        let mut first = read_line(&mut alice_read).await;
        if first == "bob logged in.\n" {
            // Bob's login may have been broadcast after alice registered
            first = read_line(&mut alice_read).await;
        }
        assert_eq!(first, "bob says: hi alice\n");

        alice_write.write_all(b"QUIT\n").await.unwrap();
        wait_for_clients(&registry, 1).await;

        // Alice's socket is closed by the server after quitting
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), alice_read.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Bob gets nothing for the quit line
        let mut line = String::new();
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), bob_read.read_line(&mut line)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ChatServer::from_listener(listener, ServerConfig::default());
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"carol\n").await.unwrap();
        wait_for_clients(&registry, 1).await;

        drop(stream);
        wait_for_clients(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_admit_with_closed_registry() {
        let registry = closed_registry();
        let dispatcher = Dispatcher::new(registry.clone());
        let (local, peer) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let session = admit(local, addr, &registry, &dispatcher, &ServerConfig::default()).await;
        assert!(session.is_none());

        // The rejected connection was closed
        let mut peer = BufReader::new(peer);
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unadmitted_clients_closed_and_loop_continues() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_loop(listener, closed_registry(), ServerConfig::default()));

        let (first, _first_write) = TcpStream::connect(addr).await.unwrap().into_split();
        expect_eof(&mut BufReader::new(first)).await;

        // The loop is still accepting after turning a client away
        let (second, _second_write) = TcpStream::connect(addr).await.unwrap().into_split();
        expect_eof(&mut BufReader::new(second)).await;

        assert!(!server.is_finished());
        server.abort();
    }

    #[tokio::test]
    async fn test_transient_accept_error_keeps_listening() {
        let (events, rx) = mpsc::channel(4);
        let registry = RegistryHandle::spawn(16);
        let config = ServerConfig {
            accept_backoff_ms: 1,
            ..ServerConfig::default()
        };
        let server = tokio::spawn(accept_loop(ScriptedAcceptor { events: rx }, registry.clone(), config));

        events
            .send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .await
            .unwrap();
        let (local, peer) = tokio::io::duplex(1024);
        events
            .send(Ok((local, "127.0.0.1:5001".parse().unwrap())))
            .await
            .unwrap();
        wait_for_clients(&registry, 1).await;

        let mut peer = BufReader::new(peer);
        peer.write_all(b"dave\n").await.unwrap();

        // Listener fails; the live session keeps the loop draining
        drop(events);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());
        assert_eq!(registry.len().await.unwrap(), 1);

        drop(peer);
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(AppError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(registry.is_empty().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_fan_out() {
        const CLIENTS: usize = 8;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ChatServer::from_listener(listener, ServerConfig::default());
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());

        let mut clients = join_all((0..CLIENTS).map(|i| async move {
            let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
            write.write_all(format!("user{}\n", i).as_bytes()).await.unwrap();
            (BufReader::new(read), write)
        }))
        .await;
        wait_for_logins(&registry, CLIENTS).await;

        clients[0].1.write_all(b"ping\n").await.unwrap();

        for (reader, _) in clients.iter_mut().skip(1) {
            let line = next_chat_line(reader, Duration::from_secs(2)).await;
            assert_eq!(line.as_deref(), Some("user0 says: ping\n"));
        }
        for (reader, _) in clients.iter_mut() {
            // No second copy for anyone, and no echo to the sender
            assert!(next_chat_line(reader, Duration::from_millis(100)).await.is_none());
        }
        assert_eq!(registry.len().await.unwrap(), CLIENTS);
    }
}
