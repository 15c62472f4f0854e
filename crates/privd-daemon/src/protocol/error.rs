//! Protocol error types for the UDS channel layer.
//!
//! This module provides structured error types for channel-level failures,
//! enabling callers to distinguish between different failure modes.
//!
//! # Security Considerations
//!
//! Error variants carry actionable context for caller branching without
//! exposing internal details that could aid attackers.

use std::io;

use thiserror::Error;

/// Maximum frame size in bytes (1 MiB).
///
/// Helper calls are small; frames are capped to prevent memory exhaustion
/// attacks.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum handshake frame size in bytes (64 KiB).
///
/// Handshake messages (Hello/HelloAck/HelloNack) have a stricter limit than
/// general protocol frames. This prevents a malicious client from consuming
/// excessive memory and CPU (JSON parsing) during the unauthenticated
/// handshake phase.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version supported by this implementation.
///
/// Version negotiation occurs during handshake. Clients with incompatible
/// versions are rejected with [`ProtocolError::VersionMismatch`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol errors for the UDS channel layer.
///
/// # Error Classification
///
/// - **Framing errors**: issues with frame encoding/decoding
/// - **Handshake errors**: version or service negotiation failures
/// - **Connection errors**: I/O and connection lifecycle issues
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    ///
    /// The length prefix indicates a size larger than the active limit.
    /// Detected BEFORE allocation to prevent memory exhaustion.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Actual frame size from the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame data is invalid or corrupted.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// Protocol version mismatch during handshake.
    #[error("version mismatch: client version {client_version}, server version {server_version}")]
    VersionMismatch {
        /// Version requested by the client.
        client_version: u32,
        /// Version supported by the server.
        server_version: u32,
    },

    /// Handshake protocol failure.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        reason: String,
    },

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout waiting for a response or operation.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Duration in milliseconds before timeout.
        duration_ms: u64,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create a version mismatch error.
    #[must_use]
    pub const fn version_mismatch(client_version: u32) -> Self {
        Self::VersionMismatch {
            client_version,
            server_version: PROTOCOL_VERSION,
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a handshake failed error.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a recoverable connection issue.
    ///
    /// Recoverable errors typically indicate transient failures where
    /// retrying the connection may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionClosed)
    }

    /// Returns `true` if this error indicates a protocol violation.
    ///
    /// Protocol violations indicate bugs in the peer implementation or
    /// malicious behavior, and the connection should be terminated.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::VersionMismatch { .. }
                | Self::HandshakeFailed { .. }
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
