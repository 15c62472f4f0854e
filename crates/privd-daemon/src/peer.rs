//! Peer identity verification for accepted connections.
//!
//! Before a connection joins the live set, the connecting process must
//! prove it runs an expected executable image. The verifier reads the
//! peer's credentials from the socket (uid/gid/pid via `SO_PEERCRED`),
//! resolves `/proc/<pid>/exe`, and compares the executable's SHA-256
//! digest against the expected digest in constant time.
//!
//! # Security Considerations
//!
//! - Verification NEVER propagates an error across the accept boundary:
//!   any failure to read, resolve, or hash is treated as a mismatch and the
//!   connection is rejected. An attacker cannot turn a probe failure into
//!   an admission.
//! - The executable read is bounded; a peer cannot make the helper hash an
//!   unbounded file.
//! - Digest and uid comparisons use constant-time equality.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Maximum executable size the verifier will hash (256 MiB).
pub const MAX_EXECUTABLE_SIZE: u64 = 256 * 1024 * 1024;

/// Read buffer size for digesting executables.
const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective uid of the peer process.
    pub uid: u32,
    /// Effective gid of the peer process.
    pub gid: u32,
    /// Process id of the peer, when the platform reports one.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Read peer credentials from a connected stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if `SO_PEERCRED` fails.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

/// Errors constructing a verifier.
///
/// These occur only at setup time; the accept-path check itself is
/// infallible by design.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The current executable path could not be determined.
    #[error("failed to resolve current executable: {0}")]
    CurrentExe(#[source] io::Error),

    /// An executable could not be read for digesting.
    #[error("failed to digest {path}: {source}")]
    Digest {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The executable exceeds the digest size bound.
    #[error("executable {path} is {size} bytes, exceeds {max} byte limit")]
    TooLarge {
        /// Path that was too large.
        path: PathBuf,
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// An expected digest string is not valid hex.
    #[error("expected digest must be 64 hex characters")]
    BadDigestHex,
}

/// Verifies that a connecting peer runs an expected executable image.
#[derive(Debug, Clone)]
pub struct CodeIdentityVerifier {
    expected_digest: [u8; 32],
    required_uid: Option<u32>,
}

impl CodeIdentityVerifier {
    /// Build a verifier that accepts peers running the helper's own
    /// executable image.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the current executable cannot be
    /// resolved or digested.
    pub fn for_current_exe() -> Result<Self, IdentityError> {
        let exe = std::env::current_exe().map_err(IdentityError::CurrentExe)?;
        let expected_digest = executable_digest(&exe)?;
        Ok(Self {
            expected_digest,
            required_uid: None,
        })
    }

    /// Build a verifier with an explicit expected digest.
    #[must_use]
    pub const fn with_expected_digest(expected_digest: [u8; 32]) -> Self {
        Self {
            expected_digest,
            required_uid: None,
        }
    }

    /// Build a verifier from a hex-encoded expected digest.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::BadDigestHex`] if the string is not 64 hex
    /// characters.
    pub fn from_hex_digest(hex: &str) -> Result<Self, IdentityError> {
        let digest = parse_hex_digest(hex).ok_or(IdentityError::BadDigestHex)?;
        Ok(Self::with_expected_digest(digest))
    }

    /// Additionally require a specific peer uid.
    #[must_use]
    pub const fn require_uid(mut self, uid: u32) -> Self {
        self.required_uid = Some(uid);
        self
    }

    /// Check a peer against the expected identity.
    ///
    /// Infallible by contract: any failure along the way (missing pid,
    /// unreadable `/proc/<pid>/exe`, digest failure) is logged and treated
    /// as a mismatch.
    #[must_use]
    pub fn matches(&self, peer: &PeerCredentials) -> bool {
        if let Some(required) = self.required_uid {
            if peer.uid.ct_eq(&required).unwrap_u8() != 1 {
                warn!(peer_uid = peer.uid, required_uid = required, "peer uid mismatch");
                return false;
            }
        }

        let Some(pid) = peer.pid else {
            warn!(peer_uid = peer.uid, "peer did not report a pid, rejecting");
            return false;
        };

        let exe_path = PathBuf::from(format!("/proc/{pid}/exe"));
        let digest = match executable_digest(&exe_path) {
            Ok(digest) => digest,
            Err(error) => {
                warn!(pid, %error, "failed to digest peer executable, rejecting");
                return false;
            }
        };

        let matched = digest.ct_eq(&self.expected_digest).unwrap_u8() == 1;
        if matched {
            debug!(pid, peer_uid = peer.uid, "peer identity verified");
        } else {
            warn!(pid, peer_uid = peer.uid, "peer executable digest mismatch");
        }
        matched
    }
}

/// SHA-256 digest of an executable, with a size bound.
fn executable_digest(path: &Path) -> Result<[u8; 32], IdentityError> {
    let map_io = |source: io::Error| IdentityError::Digest {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(map_io)?;
    let size = file.metadata().map_err(map_io)?.len();
    if size > MAX_EXECUTABLE_SIZE {
        return Err(IdentityError::TooLarge {
            path: path.to_path_buf(),
            size,
            max: MAX_EXECUTABLE_SIZE,
        });
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(map_io)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

fn parse_hex_digest(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_credentials() -> PeerCredentials {
        PeerCredentials {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: Some(std::process::id() as i32),
        }
    }

    #[test]
    fn test_current_exe_matches_itself() {
        let verifier = CodeIdentityVerifier::for_current_exe().unwrap();
        assert!(verifier.matches(&own_credentials()));
    }

    #[test]
    fn test_wrong_digest_rejected() {
        let verifier = CodeIdentityVerifier::with_expected_digest([0u8; 32]);
        assert!(!verifier.matches(&own_credentials()));
    }

    #[test]
    fn test_missing_pid_rejected() {
        let verifier = CodeIdentityVerifier::for_current_exe().unwrap();
        let mut peer = own_credentials();
        peer.pid = None;
        assert!(!verifier.matches(&peer));
    }

    #[test]
    fn test_nonexistent_pid_rejected_without_panic() {
        let verifier = CodeIdentityVerifier::for_current_exe().unwrap();
        let mut peer = own_credentials();
        // Above the default pid_max, will not exist.
        peer.pid = Some(i32::MAX);
        assert!(!verifier.matches(&peer));
    }

    #[test]
    fn test_uid_requirement() {
        let verifier = CodeIdentityVerifier::for_current_exe().unwrap();
        let peer = own_credentials();

        let accepting = verifier.clone().require_uid(peer.uid);
        assert!(accepting.matches(&peer));

        let rejecting = verifier.require_uid(peer.uid.wrapping_add(1));
        assert!(!rejecting.matches(&peer));
    }

    #[test]
    fn test_hex_digest_parsing() {
        let hex = "00".repeat(32);
        let verifier = CodeIdentityVerifier::from_hex_digest(&hex).unwrap();
        assert_eq!(verifier.expected_digest, [0u8; 32]);

        assert!(matches!(
            CodeIdentityVerifier::from_hex_digest("abc"),
            Err(IdentityError::BadDigestHex)
        ));
        assert!(matches!(
            CodeIdentityVerifier::from_hex_digest(&"zz".repeat(32)),
            Err(IdentityError::BadDigestHex)
        ));
    }

    #[test]
    fn test_digest_is_stable() {
        let exe = std::env::current_exe().unwrap();
        let a = executable_digest(&exe).unwrap();
        let b = executable_digest(&exe).unwrap();
        assert_eq!(a, b);
    }
}
