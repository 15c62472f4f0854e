//! Opaque authorization credential exchanged across the IPC boundary.
//!
//! A credential is the external form of a caller's claim to be authorized:
//! a fixed-length byte blob minted by the authority on the caller's side,
//! shipped with each privileged call, and internalized by the authority on
//! the helper's side for evaluation against one right. It is created per
//! authorization attempt and must never be cached beyond a single
//! verification.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Fixed length of a credential's external form, in bytes.
pub const CREDENTIAL_LEN: usize = 32;

/// Opaque, fixed-length authorization credential.
///
/// Equality is constant-time. `Debug` never prints the contents.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationCredential([u8; CREDENTIAL_LEN]);

impl AuthorizationCredential {
    /// Wrap a fixed-length array as a credential.
    #[must_use]
    pub const fn from_array(bytes: [u8; CREDENTIAL_LEN]) -> Self {
        Self(bytes)
    }

    /// Validate and wrap a byte slice as a credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] if the slice is not exactly
    /// [`CREDENTIAL_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let array: [u8; CREDENTIAL_LEN] =
            bytes
                .try_into()
                .map_err(|_| AuthError::InvalidCredential {
                    len: bytes.len(),
                    expected: CREDENTIAL_LEN,
                })?;
        Ok(Self(array))
    }

    /// Returns the external form as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the external form as an owned byte vector, for the wire.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl PartialEq for AuthorizationCredential {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).unwrap_u8() == 1
    }
}

impl Eq for AuthorizationCredential {}

impl fmt::Debug for AuthorizationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthorizationCredential(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_round_trip() {
        let raw = [7u8; CREDENTIAL_LEN];
        let credential = AuthorizationCredential::from_bytes(&raw).unwrap();
        assert_eq!(credential.as_bytes(), &raw);
        assert_eq!(credential.to_vec().len(), CREDENTIAL_LEN);
    }

    #[test]
    fn test_wrong_length_rejected() {
        for len in [0, 1, CREDENTIAL_LEN - 1, CREDENTIAL_LEN + 1, 1024] {
            let raw = vec![0u8; len];
            let err = AuthorizationCredential::from_bytes(&raw).unwrap_err();
            assert!(
                matches!(err, AuthError::InvalidCredential { len: l, expected }
                    if l == len && expected == CREDENTIAL_LEN),
                "length {len} should be rejected"
            );
        }
    }

    #[test]
    fn test_debug_redacts_contents() {
        let credential = AuthorizationCredential::from_array([0xAB; CREDENTIAL_LEN]);
        let debug = format!("{credential:?}");
        assert!(!debug.contains("ab"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_equality() {
        let a = AuthorizationCredential::from_array([1; CREDENTIAL_LEN]);
        let b = AuthorizationCredential::from_array([1; CREDENTIAL_LEN]);
        let c = AuthorizationCredential::from_array([2; CREDENTIAL_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_serde_is_transparent_byte_array() {
        let credential = AuthorizationCredential::from_array([3; CREDENTIAL_LEN]);
        let json = serde_json::to_string(&credential).unwrap();
        let parsed: AuthorizationCredential = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, credential);
    }
}
