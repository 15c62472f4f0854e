//! Post-handshake wire messages.
//!
//! After the handshake the client sends [`HelperRequest`] frames and the
//! server answers with [`ServerMessage`] frames. Requests and replies are
//! strictly alternating from the client's point of view; the server may
//! interleave unsolicited [`ClientEvent`] frames (shutdown notification)
//! at any time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use privd_core::{AuthError, Command};

use super::error::{ProtocolError, ProtocolResult};

/// A call from the client to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    /// Report the helper's version. Requires no authorization.
    GetVersion,

    /// Invoke a privileged command.
    ///
    /// The credential is the external form of an authorization credential
    /// minted on the caller's side. It is verified against the right
    /// registered for `command` before the command runs.
    Invoke {
        /// Command to invoke.
        command: Command,
        /// External form of the caller's authorization credential.
        credential: Vec<u8>,
        /// Command arguments, interpreted by the handler.
        #[serde(default)]
        args: Value,
    },
}

/// Typed failure for a helper call, carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum HelperCallError {
    /// The credential bytes have the wrong length.
    #[error("invalid credential")]
    InvalidCredential,

    /// The authority could not internalize the credential.
    #[error("credential could not be decoded")]
    CredentialDecodeFailed,

    /// No right is registered for the command.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The unmapped command token.
        command: String,
    },

    /// The authority evaluated the right and denied it.
    #[error("authorization denied")]
    AuthorizationDenied,

    /// The command is not supported by this helper.
    #[error("unsupported: {message}")]
    Unsupported {
        /// Description of what is unsupported.
        message: String,
    },

    /// The helper failed internally while running the command.
    #[error("internal error: {message}")]
    Internal {
        /// Sanitized failure description.
        message: String,
    },
}

impl From<AuthError> for HelperCallError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential { .. } => Self::InvalidCredential,
            AuthError::CredentialDecodeFailed => Self::CredentialDecodeFailed,
            AuthError::UnknownCommand { command } => Self::UnknownCommand { command },
            AuthError::AuthorizationDenied => Self::AuthorizationDenied,
            // Authority backend failures are reported without internal detail.
            AuthError::Authority(e) => Self::Internal {
                message: e.to_string(),
            },
        }
    }
}

/// A reply to one [`HelperRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    /// Reply to [`HelperRequest::GetVersion`].
    Version {
        /// Helper version string.
        version: String,
    },

    /// Successful reply to [`HelperRequest::Invoke`].
    Invoked {
        /// The command that ran.
        command: Command,
        /// Handler result payload.
        result: Value,
    },

    /// The request failed.
    Error {
        /// Typed failure.
        error: HelperCallError,
    },
}

/// Unsolicited notification from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The helper is shutting down and will close this connection.
    ShuttingDown {
        /// Optional human-readable reason.
        #[serde(default)]
        message: Option<String>,
    },
}

/// Envelope for all server-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to the client's outstanding request.
    Reply(HelperResponse),
    /// Unsolicited event.
    Event(ClientEvent),
}

/// Parse a request frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the payload is not a valid
/// request.
pub fn parse_request(frame: &Bytes) -> ProtocolResult<HelperRequest> {
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Serialization {
        reason: format!("invalid request: {e}"),
    })
}

/// Serialize a request into a frame payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] on encoding failure.
pub fn serialize_request(request: &HelperRequest) -> ProtocolResult<Bytes> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization {
            reason: format!("failed to encode request: {e}"),
        })
}

/// Parse a server message frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the payload is not a valid
/// server message.
pub fn parse_server_message(frame: &Bytes) -> ProtocolResult<ServerMessage> {
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Serialization {
        reason: format!("invalid server message: {e}"),
    })
}

/// Serialize a server message into a frame payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] on encoding failure.
pub fn serialize_server_message(message: &ServerMessage) -> ProtocolResult<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization {
            reason: format!("failed to encode server message: {e}"),
        })
}
