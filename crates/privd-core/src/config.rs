//! Helper configuration loaded from TOML.
//!
//! The configuration names the service (which determines the default socket
//! path), declares the authorization rights the helper synchronizes and
//! enforces, and carries the small set of runtime knobs: shutdown poll
//! interval, unmapped-command policy, and the expected peer identity.
//!
//! # Example
//!
//! ```toml
//! service = "com.example.helper"
//! poll_interval_secs = 1.0
//! unmapped_command = "deny"
//!
//! [[rights]]
//! command = "flush-cache"
//! name = "com.example.helper.flush-cache"
//! description = "Example helper wants to flush the cache."
//! rule = { kind = "constant", name = "allow" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rights::{
    AuthorizationRight, Command, RegistryError, RightRule, RightsRegistry, UnmappedCommandPolicy,
};

/// Default subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "privd";

/// Default shutdown poll interval in seconds.
const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The declared rights are invalid.
    #[error("invalid rights declaration: {0}")]
    Rights(#[from] RegistryError),

    /// A field failed validation.
    #[error("invalid config: {reason}")]
    Invalid {
        /// Description of the validation failure.
        reason: String,
    },
}

/// One declared authorization right.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RightConfig {
    /// Command token this right gates.
    pub command: String,
    /// Unique name in the authority's policy database.
    pub name: String,
    /// User-facing description for the consent prompt.
    pub description: String,
    /// Rule the authority enforces.
    pub rule: RightRule,
}

impl From<RightConfig> for AuthorizationRight {
    fn from(config: RightConfig) -> Self {
        Self {
            command: Command::new(config.command),
            name: config.name,
            description: config.description,
            rule: config.rule,
        }
    }
}

/// Process-wide helper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperConfig {
    /// Unique service name identifying the channel.
    pub service: String,

    /// Socket path override. Defaults to
    /// `$XDG_RUNTIME_DIR/privd/<service>.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Shutdown poll interval in seconds (default 1.0).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Policy when a command has no registered right (default: deny).
    #[serde(default)]
    pub unmapped_command: UnmappedCommandPolicy,

    /// Expected SHA-256 digest (hex) of the peer executable. When absent,
    /// the helper expects peers running its own executable image.
    #[serde(default)]
    pub expected_peer_digest: Option<String>,

    /// Required peer uid, if any.
    #[serde(default)]
    pub required_peer_uid: Option<u32>,

    /// Declared authorization rights.
    #[serde(default)]
    pub rights: Vec<RightConfig>,
}

fn default_poll_interval_secs() -> f64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl HelperConfig {
    /// Build a minimal configuration for a service name.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            socket_path: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            unmapped_command: UnmappedCommandPolicy::default(),
            expected_peer_digest: None,
            required_peer_uid: None,
            rights: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on a bad field value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "service name must not be empty".to_string(),
            });
        }
        if !(self.poll_interval_secs.is_finite() && self.poll_interval_secs > 0.0) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "poll_interval_secs must be a positive number, got {}",
                    self.poll_interval_secs
                ),
            });
        }
        if let Some(digest) = &self.expected_peer_digest {
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid {
                    reason: "expected_peer_digest must be 64 hex characters".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the socket path: the override, or the per-service default.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| default_socket_path(&self.service))
    }

    /// Shutdown poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// Build the rights registry from the declared rights.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Rights`] on duplicate commands or names.
    pub fn registry(&self) -> Result<RightsRegistry, ConfigError> {
        let rights = self
            .rights
            .iter()
            .cloned()
            .map(AuthorizationRight::from)
            .collect();
        Ok(RightsRegistry::new(rights)?)
    }
}

/// Default socket path for a service.
///
/// Priority:
/// 1. `$XDG_RUNTIME_DIR/privd/<service>.sock` if `XDG_RUNTIME_DIR` is set
/// 2. `/tmp/privd/<service>.sock` as fallback
#[must_use]
pub fn default_socket_path(service: &str) -> PathBuf {
    let socket_name = format!("{service}.sock");
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| {
            PathBuf::from("/tmp")
                .join(DEFAULT_SUBDIR)
                .join(&socket_name)
        },
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(DEFAULT_SUBDIR)
                .join(&socket_name)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service = "com.example.helper"
poll_interval_secs = 0.5
unmapped_command = "deny"
required_peer_uid = 0

[[rights]]
command = "flush-cache"
name = "com.example.helper.flush-cache"
description = "Example helper wants to flush the cache."
rule = { kind = "constant", name = "allow" }

[[rights]]
command = "rotate-keys"
name = "com.example.helper.rotate-keys"
description = "Example helper wants to rotate keys."
rule = { kind = "custom", version = 2 }

[[rights]]
command = "erase-disk"
name = "com.example.helper.erase-disk"
description = "Example helper wants to erase a disk."
rule = { kind = "default_administrator" }
"#;

    #[test]
    fn test_parse_sample() {
        let config = HelperConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.service, "com.example.helper");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.required_peer_uid, Some(0));

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 3);
        let right = registry.lookup(&Command::from("rotate-keys")).unwrap();
        assert!(matches!(right.rule, RightRule::Custom { version: 2, .. }));
    }

    #[test]
    fn test_defaults() {
        let config = HelperConfig::from_toml(r#"service = "svc""#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.unmapped_command, UnmappedCommandPolicy::Deny);
        assert!(config.rights.is_empty());
        assert!(config
            .socket_path()
            .ends_with(format!("{DEFAULT_SUBDIR}/svc.sock")));
    }

    #[test]
    fn test_empty_service_rejected() {
        let err = HelperConfig::from_toml(r#"service = """#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_bad_poll_interval_rejected() {
        let err =
            HelperConfig::from_toml("service = \"svc\"\npoll_interval_secs = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_bad_digest_rejected() {
        let err = HelperConfig::from_toml(
            "service = \"svc\"\nexpected_peer_digest = \"not-a-digest\"",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = HelperConfig::from_toml("service = \"svc\"\nbogus = 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_right_command_rejected() {
        let toml = r#"
service = "svc"

[[rights]]
command = "x"
name = "svc.a"
description = "a"
rule = { kind = "default_administrator" }

[[rights]]
command = "x"
name = "svc.b"
description = "b"
rule = { kind = "default_administrator" }
"#;
        let config = HelperConfig::from_toml(toml).unwrap();
        assert!(matches!(
            config.registry().unwrap_err(),
            ConfigError::Rights(RegistryError::DuplicateCommand { .. })
        ));
    }
}
