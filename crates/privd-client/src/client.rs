//! Helper client: cached connection and call proxy.
//!
//! # Architecture
//!
//! ```text
//! HelperClient ──> remote_proxy(on_error) ──> HelperProxy
//!      │                                          │
//!      │ caches one CachedChannel                 │ mpsc calls
//!      ▼                                          ▼
//!  ClientShared.cached ◄── deferred clear ── connection task
//!                                             (owns the socket)
//! ```
//!
//! The client lazily establishes a single connection to the helper and
//! caches it; every proxy handed out shares that connection. When the
//! connection dies the connection task fails outstanding calls with
//! [`ClientError::ChannelInvalidated`], notifies each proxy's error
//! handler on its next use, and clears the cache from a separate task so
//! a caller holding the cache lock at that moment is never deadlocked.
//! The next call after invalidation establishes a fresh connection.
//!
//! On non-Unix platforms [`HelperClient::remote_proxy`] fails fast with
//! [`ClientError::UnsupportedPlatform`] before touching any socket API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use privd_core::{default_socket_path, AuthorizationCredential, Command};
use privd_daemon::protocol::{ClientEvent, HelperRequest, HelperResponse, ProtocolError};

use crate::error::ClientError;

#[cfg(unix)]
use futures::{SinkExt, StreamExt};
#[cfg(unix)]
use privd_daemon::protocol::{
    parse_handshake_message, parse_server_message, serialize_handshake_message, serialize_request,
    ClientHandshake, FrameCodec, HandshakeMessage, ServerMessage,
};
#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(unix)]
use tokio_util::codec::Framed;

/// Default per-call timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Depth of the per-channel call queue.
const CALL_QUEUE_DEPTH: usize = 16;

/// Invoked with every channel invalidation a proxy observes.
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Invoked with unsolicited events from the helper.
pub type EventHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Service name to request during handshake.
    pub service: String,
    /// Socket path of the helper.
    pub socket_path: PathBuf,
    /// Client identification string sent in the hello.
    pub client_info: String,
    /// Per-call and connect timeout.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Configuration with the default socket path for a service.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            socket_path: default_socket_path(&service),
            client_info: format!("privd-client/{}", env!("CARGO_PKG_VERSION")),
            timeout: DEFAULT_TIMEOUT,
            service,
        }
    }

    /// Override the socket path.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Override the call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One in-flight call handed to the connection task.
struct ProxyCall {
    request: HelperRequest,
    reply: oneshot::Sender<Result<HelperResponse, ClientError>>,
}

/// The cached live channel.
struct CachedChannel {
    generation: u64,
    calls: mpsc::Sender<ProxyCall>,
    server_info: String,
}

/// State shared between the client, its proxies, and connection tasks.
struct ClientShared {
    cached: Mutex<Option<CachedChannel>>,
    next_generation: AtomicU64,
    event_handler: StdMutex<Option<EventHandler>>,
}

/// Entry point for talking to the helper.
pub struct HelperClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
}

impl HelperClient {
    /// Create a client. No connection is made until the first proxy call.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(ClientShared {
                cached: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                event_handler: StdMutex::new(None),
            }),
        }
    }

    /// Install a handler for unsolicited helper events.
    pub fn set_event_handler(&self, handler: EventHandler) {
        *self
            .shared
            .event_handler
            .lock()
            .expect("event handler lock poisoned") = Some(handler);
    }

    /// Drop the cached channel, if any. The next proxy call reconnects.
    pub async fn invalidate(&self) {
        let mut cached = self.shared.cached.lock().await;
        if cached.take().is_some() {
            debug!("cached helper channel dropped on request");
        }
    }

    /// Obtain a proxy for calling the helper.
    ///
    /// Reuses the cached channel when it is still alive; otherwise
    /// connects, performs the handshake, and caches the new channel.
    /// `on_error` fires whenever a call through the returned proxy
    /// observes a channel invalidation.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnsupportedPlatform`] off Unix,
    /// [`ClientError::HelperNotRunning`] when the socket is absent, and
    /// handshake or I/O errors otherwise.
    #[allow(unused_variables)]
    pub async fn remote_proxy(&self, on_error: ErrorHandler) -> Result<HelperProxy, ClientError> {
        #[cfg(not(unix))]
        {
            Err(ClientError::UnsupportedPlatform)
        }
        #[cfg(unix)]
        {
            // Holding the cache lock across establishment serializes
            // concurrent callers onto one connection.
            let mut cached = self.shared.cached.lock().await;

            if let Some(channel) = cached.as_ref() {
                if channel.calls.is_closed() {
                    // The connection task died but its deferred clear has
                    // not run yet.
                    *cached = None;
                } else {
                    debug!(generation = channel.generation, "reusing cached helper channel");
                    return Ok(HelperProxy {
                        calls: channel.calls.clone(),
                        server_info: channel.server_info.clone(),
                        timeout: self.config.timeout,
                        on_error,
                    });
                }
            }

            let channel = self.establish().await?;
            let proxy = HelperProxy {
                calls: channel.calls.clone(),
                server_info: channel.server_info.clone(),
                timeout: self.config.timeout,
                on_error,
            };
            *cached = Some(channel);
            Ok(proxy)
        }
    }

    #[cfg(unix)]
    async fn establish(&self) -> Result<CachedChannel, ClientError> {
        if !self.config.socket_path.exists() {
            return Err(ClientError::HelperNotRunning);
        }

        let stream = tokio::time::timeout(
            self.config.timeout,
            UnixStream::connect(&self.config.socket_path),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let handshake = ClientHandshake::new(&*self.config.client_info, &*self.config.service);
        let hello =
            serialize_handshake_message(&HandshakeMessage::Hello(handshake.create_hello()))?;
        framed.send(hello).await?;

        let frame = tokio::time::timeout(self.config.timeout, framed.next())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or_else(|| ClientError::ChannelInvalidated {
                reason: "helper closed the connection during handshake".to_string(),
            })??;
        let server_info = handshake.process_response(parse_handshake_message(&frame)?)?;
        framed.codec_mut().upgrade_to_full_frame_size();

        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        debug!(generation, %server_info, "helper channel established");
        tokio::spawn(connection_task(
            framed,
            calls_rx,
            Arc::clone(&self.shared),
            generation,
        ));

        Ok(CachedChannel {
            generation,
            calls: calls_tx,
            server_info,
        })
    }
}

/// Owns one connection: writes calls, routes replies and events.
#[cfg(unix)]
async fn connection_task(
    mut framed: Framed<UnixStream, FrameCodec>,
    mut calls: mpsc::Receiver<ProxyCall>,
    shared: Arc<ClientShared>,
    generation: u64,
) {
    let mut pending: Option<oneshot::Sender<Result<HelperResponse, ClientError>>> = None;

    let reason = loop {
        tokio::select! {
            // One call in flight at a time; the queue holds the rest.
            call = calls.recv(), if pending.is_none() => {
                let Some(ProxyCall { request, reply }) = call else {
                    break "all proxies dropped".to_string();
                };
                let payload = match serialize_request(&request) {
                    Ok(payload) => payload,
                    Err(error) => {
                        let _ = reply.send(Err(error.into()));
                        continue;
                    }
                };
                if let Err(error) = framed.send(payload).await {
                    let reason = error.to_string();
                    let _ = reply.send(Err(ClientError::ChannelInvalidated {
                        reason: reason.clone(),
                    }));
                    break reason;
                }
                pending = Some(reply);
            }
            frame = framed.next() => {
                match frame {
                    None => break "helper closed the connection".to_string(),
                    Some(Err(error)) => break error.to_string(),
                    Some(Ok(frame)) => match parse_server_message(&frame) {
                        Err(error) => break error.to_string(),
                        Ok(ServerMessage::Reply(response)) => {
                            if let Some(reply) = pending.take() {
                                let _ = reply.send(Ok(response));
                            } else {
                                warn!("unsolicited reply from helper, dropping");
                            }
                        }
                        Ok(ServerMessage::Event(event)) => {
                            debug!(?event, "event from helper");
                            let handler = shared
                                .event_handler
                                .lock()
                                .expect("event handler lock poisoned")
                                .clone();
                            if let Some(handler) = handler {
                                handler(event);
                            }
                        }
                    },
                }
            }
        }
    };

    debug!(generation, %reason, "helper channel ended");
    if let Some(reply) = pending.take() {
        let _ = reply.send(Err(ClientError::ChannelInvalidated {
            reason: reason.clone(),
        }));
    }
    calls.close();
    while let Ok(ProxyCall { reply, .. }) = calls.try_recv() {
        let _ = reply.send(Err(ClientError::ChannelInvalidated {
            reason: reason.clone(),
        }));
    }

    // Deferred cache clear: a caller may hold the cache lock right now,
    // so clear from a fresh task, and only if the cache still holds this
    // generation rather than a replacement channel.
    tokio::spawn(async move {
        let mut cached = shared.cached.lock().await;
        if cached
            .as_ref()
            .is_some_and(|channel| channel.generation == generation)
        {
            *cached = None;
            debug!(generation, "cleared cached helper channel");
        }
    });
}

/// A handle for calling the helper over the shared cached channel.
///
/// Cheap to clone-by-recreation: obtain one per call site via
/// [`HelperClient::remote_proxy`]; all proxies share the underlying
/// connection.
pub struct HelperProxy {
    calls: mpsc::Sender<ProxyCall>,
    server_info: String,
    timeout: Duration,
    on_error: ErrorHandler,
}

impl std::fmt::Debug for HelperProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperProxy")
            .field("server_info", &self.server_info)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HelperProxy {
    /// Identification string the helper sent during handshake.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Ask the helper for its version.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or an unexpected
    /// response shape.
    pub async fn get_version(&self) -> Result<String, ClientError> {
        match self.call(HelperRequest::GetVersion).await? {
            HelperResponse::Version { version } => Ok(version),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Invoke a privileged command with an authorization credential.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Call`] for typed helper failures (denial,
    /// unknown command, bad credential) and transport errors otherwise.
    pub async fn invoke(
        &self,
        command: Command,
        credential: &AuthorizationCredential,
        args: Value,
    ) -> Result<Value, ClientError> {
        let request = HelperRequest::Invoke {
            command,
            credential: credential.to_vec(),
            args,
        };
        match self.call(request).await? {
            HelperResponse::Invoked { result, .. } => Ok(result),
            other => Err(unexpected_response(&other)),
        }
    }

    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = async {
            self.calls
                .send(ProxyCall {
                    request,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| ClientError::ChannelInvalidated {
                    reason: "helper channel closed".to_string(),
                })?;
            match tokio::time::timeout(self.timeout, reply_rx).await {
                Err(_) => Err(ClientError::Timeout),
                Ok(Err(_)) => Err(ClientError::ChannelInvalidated {
                    reason: "helper channel closed".to_string(),
                }),
                Ok(Ok(result)) => result,
            }
        }
        .await;

        match outcome {
            Ok(HelperResponse::Error { error }) => Err(ClientError::Call(error)),
            Ok(response) => Ok(response),
            Err(error) => {
                if error.is_invalidation() {
                    (self.on_error)(&error);
                }
                Err(error)
            }
        }
    }
}

fn unexpected_response(response: &HelperResponse) -> ClientError {
    ClientError::Protocol(ProtocolError::InvalidFrame {
        reason: format!("unexpected response from helper: {response:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("com.example.helper");
        assert!(config.socket_path.ends_with("privd/com.example.helper.sock"));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.client_info.starts_with("privd-client/"));
    }

    #[tokio::test]
    async fn test_missing_socket_is_helper_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::new("svc").with_socket_path(dir.path().join("absent.sock"));
        let client = HelperClient::new(config);

        let err = client
            .remote_proxy(Arc::new(|_| {}))
            .await
            .expect_err("connect to a missing socket must fail");
        assert!(matches!(err, ClientError::HelperNotRunning));
    }
}
