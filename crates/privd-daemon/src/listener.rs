//! Unix domain socket listener and connection lifecycle.
//!
//! # Architecture
//!
//! ```text
//! accept ──> peer credentials ──> identity check ──> register ──> serve
//!                  │                    │
//!                  └── failure ─────────┴──> drop stream (live set untouched)
//! ```
//!
//! The listener accepts connections, verifies the peer's identity, and
//! admits verified peers into the live connection set. Each admitted
//! connection is served by its own task: handshake, then a request/reply
//! loop. When a connection ends for any reason its task removes it from
//! the live set; when the set becomes empty the listener raises the
//! shutdown signal, which the lifecycle poll loop observes.
//!
//! # Security Considerations
//!
//! - Peer verification happens before the peer's first byte is parsed.
//!   A rejected peer never reaches the handshake parser.
//! - The socket directory is created mode `0700` and the socket itself is
//!   chmodded to `0600`; a symlinked socket directory is refused.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use privd_core::{default_socket_path, HelperConfig};

use crate::dispatch::HelperDispatcher;
use crate::peer::{CodeIdentityVerifier, PeerCredentials};
use crate::protocol::{
    parse_handshake_message, parse_request, serialize_handshake_message, serialize_server_message,
    ClientEvent, FrameCodec, HandshakeMessage, HandshakeOutcome, ProtocolError, ProtocolResult,
    ServerHandshake, ServerMessage,
};

/// Time allowed for a verified peer to complete the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Service name negotiated during handshake.
    pub service: String,
    /// Socket path to bind.
    pub socket_path: PathBuf,
    /// Server identification string sent in the handshake ack.
    pub server_info: String,
}

impl ListenerConfig {
    /// Configuration with the default socket path for a service.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            socket_path: default_socket_path(&service),
            server_info: format!("privd/{}", env!("CARGO_PKG_VERSION")),
            service,
        }
    }

    /// Configuration derived from a [`HelperConfig`].
    #[must_use]
    pub fn from_helper_config(config: &HelperConfig) -> Self {
        Self {
            service: config.service.clone(),
            socket_path: config.socket_path(),
            server_info: format!("privd/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Override the socket path.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }
}

/// One admitted connection, as seen by the live set.
#[derive(Debug)]
struct ConnectionEntry {
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Shared live-set state.
#[derive(Debug)]
struct ListenerState {
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    last_connection: Mutex<Option<u64>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ListenerState {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connections: Mutex::new(HashMap::new()),
            last_connection: Mutex::new(None),
            next_id: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Admit a connection into the live set, returning its id.
    fn register(&self, events: mpsc::UnboundedSender<ClientEvent>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(id, ConnectionEntry { events });
        *self
            .last_connection
            .lock()
            .expect("last connection lock poisoned") = Some(id);
        id
    }

    /// Remove a connection. Raises the shutdown signal when the set empties.
    fn remove(&self, id: u64) {
        let now_empty = {
            let mut connections = self.connections.lock().expect("connections lock poisoned");
            connections.remove(&id);
            let mut last = self
                .last_connection
                .lock()
                .expect("last connection lock poisoned");
            if *last == Some(id) {
                *last = connections.keys().max().copied();
            }
            connections.is_empty()
        };
        if now_empty {
            info!(connection = id, "last live connection closed, requesting shutdown");
            let _ = self.shutdown.send(true);
        } else {
            debug!(connection = id, "connection removed from live set");
        }
    }

    fn count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .len()
    }
}

/// The helper's listening socket and live connection set.
#[derive(Debug)]
pub struct HelperListener {
    config: ListenerConfig,
    listener: UnixListener,
    state: Arc<ListenerState>,
}

impl HelperListener {
    /// Bind the socket and prepare the live set.
    ///
    /// Creates the socket directory mode `0700`, removes a stale socket
    /// left by a previous run, and restricts the socket to mode `0600`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] if the directory is unusable, the
    /// stale path is not a socket, or the bind fails.
    pub fn bind(config: ListenerConfig) -> ProtocolResult<Self> {
        prepare_socket_dir(&config.socket_path)?;
        remove_stale_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path)?;
        std::fs::set_permissions(
            &config.socket_path,
            std::fs::Permissions::from_mode(0o600),
        )?;

        info!(path = %config.socket_path.display(), service = %config.service, "helper socket bound");
        Ok(Self {
            config,
            listener,
            state: Arc::new(ListenerState::new()),
        })
    }

    /// Path of the bound socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Service name this listener answers for.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.config.service
    }

    /// Number of connections currently in the live set.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.count()
    }

    /// Subscribe to the shutdown signal.
    ///
    /// The signal flips to `true` when the live set empties or when
    /// [`request_shutdown`](Self::request_shutdown) is called.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.state.shutdown.subscribe()
    }

    /// Raise the shutdown signal explicitly.
    ///
    /// Live connections are notified and closed; the accept loop stops.
    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        let _ = self.state.shutdown.send(true);
    }

    /// Deliver an event to the most recently admitted live connection.
    ///
    /// Returns `false` if the live set is empty or the connection is
    /// already gone.
    pub fn notify_last_connection(&self, event: ClientEvent) -> bool {
        let last = *self
            .state
            .last_connection
            .lock()
            .expect("last connection lock poisoned");
        let Some(id) = last else {
            return false;
        };
        let connections = self
            .state
            .connections
            .lock()
            .expect("connections lock poisoned");
        connections
            .get(&id)
            .is_some_and(|entry| entry.events.send(event).is_ok())
    }

    /// Run the accept loop until the shutdown signal is raised.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] only for fatal listener failures;
    /// per-connection errors are logged and contained.
    pub async fn run(
        self: Arc<Self>,
        verifier: Arc<CodeIdentityVerifier>,
        dispatcher: Arc<HelperDispatcher>,
    ) -> ProtocolResult<()> {
        let mut shutdown_rx = self.state.shutdown.subscribe();
        info!(service = %self.config.service, "accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => self.handle_accept(stream, &verifier, &dispatcher),
                        Err(error) => warn!(%error, "accept failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("accept loop stopped");
        Ok(())
    }

    /// Verify a freshly accepted peer and, if verified, admit and serve it.
    ///
    /// Never propagates an error: every failure rejects the connection and
    /// leaves the live set untouched.
    fn handle_accept(
        self: &Arc<Self>,
        stream: UnixStream,
        verifier: &Arc<CodeIdentityVerifier>,
        dispatcher: &Arc<HelperDispatcher>,
    ) {
        let peer = match PeerCredentials::from_stream(&stream) {
            Ok(peer) => peer,
            Err(error) => {
                warn!(%error, "could not read peer credentials, rejecting connection");
                return;
            }
        };

        if !verifier.matches(&peer) {
            warn!(uid = peer.uid, pid = ?peer.pid, "rejected unverified peer");
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.state.register(events_tx);
        info!(connection = id, uid = peer.uid, pid = ?peer.pid, "peer verified, connection admitted");

        let state = Arc::clone(&self.state);
        let dispatcher = Arc::clone(dispatcher);
        let shutdown_rx = self.state.shutdown.subscribe();
        let server_info = self.config.server_info.clone();
        let service = self.config.service.clone();
        tokio::spawn(async move {
            let framed = Framed::new(stream, FrameCodec::new());
            if let Err(error) =
                serve_connection(framed, id, &dispatcher, events_rx, shutdown_rx, &server_info, &service)
                    .await
            {
                debug!(connection = id, %error, "connection ended with error");
            }
            state.remove(id);
        });
    }
}

impl Drop for HelperListener {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.config.socket_path) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(%error, "failed to remove socket on shutdown");
            }
        }
    }
}

/// Serve one admitted connection: handshake, then request/reply until the
/// peer disconnects or shutdown is signalled.
async fn serve_connection(
    mut framed: Framed<UnixStream, FrameCodec>,
    id: u64,
    dispatcher: &HelperDispatcher,
    mut events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    server_info: &str,
    service: &str,
) -> ProtocolResult<()> {
    if !perform_server_handshake(&mut framed, server_info, service).await? {
        return Ok(());
    }
    framed.codec_mut().upgrade_to_full_frame_size();
    debug!(connection = id, "handshake complete");

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else {
                    debug!(connection = id, "peer disconnected");
                    break;
                };
                let request = parse_request(&frame?)?;
                let response = dispatcher.dispatch(request).await;
                let payload = serialize_server_message(&ServerMessage::Reply(response))?;
                framed.send(payload).await?;
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let payload = serialize_server_message(&ServerMessage::Event(event))?;
                framed.send(payload).await?;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let notice = ServerMessage::Event(ClientEvent::ShuttingDown {
                        message: Some("helper shutting down".to_string()),
                    });
                    if let Ok(payload) = serialize_server_message(&notice) {
                        let _ = framed.send(payload).await;
                    }
                    debug!(connection = id, "closing for shutdown");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Run the server side of the handshake. Returns `true` when the
/// connection was accepted.
async fn perform_server_handshake(
    framed: &mut Framed<UnixStream, FrameCodec>,
    server_info: &str,
    service: &str,
) -> ProtocolResult<bool> {
    let mut handshake = ServerHandshake::new(server_info, service);

    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| ProtocolError::timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))?
        .ok_or(ProtocolError::ConnectionClosed)??;

    let HandshakeMessage::Hello(hello) = parse_handshake_message(&frame)? else {
        return Err(ProtocolError::handshake_failed(
            "expected hello as first message",
        ));
    };

    match handshake.process_hello(&hello)? {
        HandshakeOutcome::Accepted { ack, client_info } => {
            let payload = serialize_handshake_message(&HandshakeMessage::HelloAck(ack))?;
            framed.send(payload).await?;
            debug!(%client_info, "handshake accepted");
            Ok(true)
        }
        HandshakeOutcome::Refused { nack } => {
            warn!(code = %nack.error_code, message = %nack.message, "handshake refused");
            let payload = serialize_handshake_message(&HandshakeMessage::HelloNack(nack))?;
            let _ = framed.send(payload).await;
            Ok(false)
        }
    }
}

/// Create the socket directory with restrictive permissions.
fn prepare_socket_dir(socket_path: &Path) -> ProtocolResult<()> {
    let Some(dir) = socket_path.parent() else {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path has no parent directory",
        )));
    };

    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("socket directory {} is a symlink", dir.display()),
            )));
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("socket directory {} is not a directory", dir.display()),
            )));
        }
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)?;
        }
        Err(error) => return Err(ProtocolError::Io(error)),
    }

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Remove a socket file left over from a previous run.
fn remove_stale_socket(socket_path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(socket_path) {
        Ok(meta) if meta.file_type().is_socket() => {
            warn!(path = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(socket_path)?;
            Ok(())
        }
        Ok(_) => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "{} exists and is not a socket",
                socket_path.display()
            ),
        ))),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(ProtocolError::Io(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_live_set_empty_raises_shutdown() {
        let state = ListenerState::new();
        let mut rx = state.shutdown.subscribe();

        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let a = state.register(tx_a);
        let b = state.register(tx_b);
        assert_eq!(state.count(), 2);

        state.remove(a);
        assert!(!*rx.borrow_and_update(), "shutdown must not fire while connections remain");

        state.remove(b);
        assert!(*rx.borrow_and_update(), "shutdown must fire when the set empties");
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_last_connection_tracks_removal() {
        let state = ListenerState::new();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let a = state.register(tx_a);
        let b = state.register(tx_b);

        assert_eq!(*state.last_connection.lock().unwrap(), Some(b));
        state.remove(b);
        assert_eq!(*state.last_connection.lock().unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_bind_creates_directory_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("svc.sock");
        let config = ListenerConfig::new("svc").with_socket_path(&path);

        let listener = HelperListener::bind(config).unwrap();
        assert!(path.exists());
        assert_eq!(listener.connection_count(), 0);

        drop(listener);
        assert!(!path.exists(), "socket must be removed on drop");
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");

        let first = HelperListener::bind(ListenerConfig::new("svc").with_socket_path(&path)).unwrap();
        // Simulate an unclean exit: the socket file survives.
        std::mem::forget(first);

        let second = HelperListener::bind(ListenerConfig::new("svc").with_socket_path(&path)).unwrap();
        assert_eq!(second.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_refuses_non_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = HelperListener::bind(ListenerConfig::new("svc").with_socket_path(&path))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn test_bind_refuses_symlinked_directory() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = HelperListener::bind(
            ListenerConfig::new("svc").with_socket_path(link.join("svc.sock")),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_notify_without_connections() {
        let state = ListenerState::new();
        assert_eq!(*state.last_connection.lock().unwrap(), None);
    }
}
