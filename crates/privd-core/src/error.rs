//! Shared error taxonomy for authorization.
//!
//! Two layers of errors exist: [`AuthorityError`] covers failures reported by
//! (or about) the system security authority, and [`AuthError`] is the typed
//! outcome of verifying a caller's credential against a registered right.
//!
//! # Propagation Policy
//!
//! - Security-relevant failures (denied authorization, malformed credential)
//!   must never be silently upgraded to success by callers.
//! - Bookkeeping failures ([`AuthorityError::Failure`]) during right
//!   synchronization are loggable and skippable; they never abort the batch.

use thiserror::Error;

/// Errors reported by the system security authority.
///
/// Status codes carried by [`AuthorityError::Failure`] are opaque platform
/// codes; the core treats any non-success as a loggable, skippable failure
/// during synchronization and as a hard failure during verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// The authority evaluated the right and denied the request.
    #[error("authorization denied by authority")]
    Denied,

    /// The credential blob could not be converted into an authority-native
    /// reference.
    #[error("credential could not be internalized by authority")]
    MalformedCredential,

    /// The authority (or a rule definition) is unavailable on this platform.
    #[error("security authority unsupported on this platform")]
    Unsupported,

    /// Any other authority failure, carrying an opaque platform status code.
    #[error("authority operation failed (status {status}): {message}")]
    Failure {
        /// Opaque platform status code.
        status: i32,
        /// Human-readable description of the failure.
        message: String,
    },
}

impl AuthorityError {
    /// Create a generic failure with an opaque status code.
    #[must_use]
    pub fn failure(status: i32, message: impl Into<String>) -> Self {
        Self::Failure {
            status,
            message: message.into(),
        }
    }
}

/// Typed outcome of verifying a credential against a registered right.
///
/// These map one-to-one onto the wire-level call errors reported back to the
/// caller of a privileged operation. A verification failure aborts the
/// operation before any side effects occur.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credential blob is not exactly the expected fixed length.
    ///
    /// Detected before the authority is consulted.
    #[error("invalid credential: {len} bytes, expected {expected}")]
    InvalidCredential {
        /// Length of the presented blob.
        len: usize,
        /// Expected credential length.
        expected: usize,
    },

    /// The credential could not be converted into an authority-native
    /// reference.
    #[error("credential decode failed")]
    CredentialDecodeFailed,

    /// The command has no registered authorization right.
    #[error("no authorization right registered for command {command:?}")]
    UnknownCommand {
        /// The unmapped command token.
        command: String,
    },

    /// The authority denied the request.
    #[error("authorization denied")]
    AuthorizationDenied,

    /// Any other authority failure during verification.
    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),
}

impl AuthError {
    /// Returns `true` if this failure is an authorization denial rather than
    /// an operational error.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationDenied | Self::Authority(AuthorityError::Denied)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_failure_display() {
        let err = AuthorityError::failure(-60005, "errAuthorizationDenied");
        let msg = err.to_string();
        assert!(msg.contains("-60005"));
        assert!(msg.contains("errAuthorizationDenied"));
    }

    #[test]
    fn test_denied_maps_through_from() {
        let err: AuthError = AuthorityError::Denied.into();
        assert!(err.is_denial());
    }

    #[test]
    fn test_invalid_credential_is_not_denial() {
        let err = AuthError::InvalidCredential {
            len: 7,
            expected: 32,
        };
        assert!(!err.is_denial());
        assert!(err.to_string().contains('7'));
    }
}
