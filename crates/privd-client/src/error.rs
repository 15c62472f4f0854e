//! Client-side error taxonomy.

use std::io;

use thiserror::Error;

use privd_daemon::protocol::{HelperCallError, ProtocolError};

/// Errors surfaced to helper client callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Privileged helper IPC is not available on this platform.
    #[error("privileged helper IPC is unsupported on this platform")]
    UnsupportedPlatform,

    /// The helper socket does not exist or refused the connection.
    #[error("helper is not running")]
    HelperNotRunning,

    /// The cached channel died underneath an outstanding or future call.
    #[error("helper channel invalidated: {reason}")]
    ChannelInvalidated {
        /// Why the channel died.
        reason: String,
    },

    /// The operation did not complete in time.
    #[error("helper call timed out")]
    Timeout,

    /// The helper refused the connection during handshake.
    #[error("handshake with helper failed: {reason}")]
    Handshake {
        /// Refusal detail.
        reason: String,
    },

    /// The helper processed the call and reported a typed failure.
    #[error("helper call failed: {0}")]
    Call(HelperCallError),

    /// Channel-level protocol failure.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl ClientError {
    /// Returns `true` when the failure means the cached channel is gone
    /// and the next call will establish a fresh one.
    #[must_use]
    pub const fn is_invalidation(&self) -> bool {
        matches!(self, Self::ChannelInvalidated { .. })
    }
}

impl From<io::Error> for ClientError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => Self::HelperNotRunning,
            _ => Self::Io(error),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::HandshakeFailed { reason } => Self::Handshake { reason },
            ProtocolError::VersionMismatch {
                client_version,
                server_version,
            } => Self::Handshake {
                reason: format!(
                    "protocol version mismatch (client {client_version}, helper {server_version})"
                ),
            },
            ProtocolError::Timeout { .. } => Self::Timeout,
            other => Self::Protocol(other),
        }
    }
}
