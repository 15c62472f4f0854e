//! Authorization right definitions and the construction-time registry.
//!
//! A right gates one privileged command. Each right names an entry in the
//! system authority's policy database and carries the rule the authority
//! should enforce for it: either a custom versioned key-value policy, a
//! reference to a built-in system rule by name, or the default fallback
//! requiring administrator authentication.
//!
//! # Invariants
//!
//! - Exactly one rule variant is active per right
//! - Rights are immutable once constructed; the registry has no mutation API
//! - Registry construction rejects duplicate commands and duplicate right
//!   names

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the built-in system rule requiring administrator authentication.
pub const DEFAULT_ADMIN_RULE: &str = "authenticate-admin";

/// Well-known keys for custom rule definitions.
pub const RULE_KEY_CLASS: &str = "class";
/// Rule group key.
pub const RULE_KEY_GROUP: &str = "group";
/// Referenced rule list key.
pub const RULE_KEY_RULE: &str = "rule";
/// Grant timeout key (seconds).
pub const RULE_KEY_TIMEOUT: &str = "timeout";
/// Rule version key, compared during synchronization.
pub const RULE_KEY_VERSION: &str = "version";

/// Opaque command selector gated by an authorization right.
///
/// Commands are matched by exact string equality; the token itself carries
/// no structure as far as the authorization layer is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(String);

impl Command {
    /// Create a command token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Command {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// The rule enforced by the authority for one right.
///
/// Exactly one variant is active per right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RightRule {
    /// Custom versioned key-value policy written into the authority verbatim.
    ///
    /// The version number (also present under [`RULE_KEY_VERSION`] in the
    /// definition) drives the update decision during synchronization.
    Custom {
        /// Version of this rule definition.
        version: u64,
        /// Key-value policy body. Well-known keys: [`RULE_KEY_CLASS`],
        /// [`RULE_KEY_GROUP`], [`RULE_KEY_RULE`], [`RULE_KEY_TIMEOUT`].
        #[serde(default)]
        definition: BTreeMap<String, serde_json::Value>,
    },

    /// Reference to a built-in system rule by name.
    Constant {
        /// Name of the built-in rule, e.g. `authenticate-admin`.
        name: String,
    },

    /// Fallback rule requiring administrator authentication.
    DefaultAdministrator,
}

impl RightRule {
    /// Returns the constant rule name this rule resolves to, if any.
    ///
    /// [`RightRule::DefaultAdministrator`] resolves to
    /// [`DEFAULT_ADMIN_RULE`]; custom rules have no constant name.
    #[must_use]
    pub fn constant_rule_name(&self) -> Option<&str> {
        match self {
            Self::Constant { name } => Some(name),
            Self::DefaultAdministrator => Some(DEFAULT_ADMIN_RULE),
            Self::Custom { .. } => None,
        }
    }
}

/// A named, policy-backed permission gating one privileged command.
///
/// Constructed at process start from static configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRight {
    /// Command this right gates.
    pub command: Command,

    /// Unique name, the key into the system authority's policy database.
    pub name: String,

    /// User-facing description shown when the authority prompts for consent.
    pub description: String,

    /// Rule the authority enforces for this right.
    pub rule: RightRule,
}

impl AuthorizationRight {
    /// Create a right backed by a built-in system rule.
    #[must_use]
    pub fn constant(
        command: impl Into<Command>,
        name: impl Into<String>,
        description: impl Into<String>,
        rule_name: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            description: description.into(),
            rule: RightRule::Constant {
                name: rule_name.into(),
            },
        }
    }

    /// Create a right backed by a custom versioned rule definition.
    #[must_use]
    pub fn custom(
        command: impl Into<Command>,
        name: impl Into<String>,
        description: impl Into<String>,
        version: u64,
        definition: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            description: description.into(),
            rule: RightRule::Custom {
                version,
                definition,
            },
        }
    }

    /// Create a right using the default administrator-authentication rule.
    #[must_use]
    pub fn admin(
        command: impl Into<Command>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            description: description.into(),
            rule: RightRule::DefaultAdministrator,
        }
    }
}

impl From<String> for Command {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Errors raised while constructing a [`RightsRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two rights declared the same command.
    #[error("duplicate right for command {command:?}")]
    DuplicateCommand {
        /// The duplicated command token.
        command: String,
    },

    /// Two rights declared the same authority name.
    #[error("duplicate right name {name:?}")]
    DuplicateName {
        /// The duplicated right name.
        name: String,
    },
}

/// Policy applied when a command has no registered right.
///
/// An explicit, configurable choice; the default fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedCommandPolicy {
    /// Reject calls whose command has no registered right (default).
    #[default]
    Deny,
    /// Permit calls whose command has no registered right.
    Allow,
}

/// Construction-time set of authorization rights.
///
/// Preserves declaration order (synchronization walks rights in order) and
/// offers lookup by command. There is no mutation API.
#[derive(Debug, Clone)]
pub struct RightsRegistry {
    rights: Vec<AuthorizationRight>,
    by_command: HashMap<Command, usize>,
}

impl RightsRegistry {
    /// Build a registry from an ordered sequence of rights.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if two rights share a command or a name.
    pub fn new(rights: Vec<AuthorizationRight>) -> Result<Self, RegistryError> {
        let mut by_command = HashMap::with_capacity(rights.len());
        let mut names = HashMap::with_capacity(rights.len());

        for (index, right) in rights.iter().enumerate() {
            if by_command.insert(right.command.clone(), index).is_some() {
                return Err(RegistryError::DuplicateCommand {
                    command: right.command.as_str().to_string(),
                });
            }
            if names.insert(right.name.clone(), index).is_some() {
                return Err(RegistryError::DuplicateName {
                    name: right.name.clone(),
                });
            }
        }

        Ok(Self { rights, by_command })
    }

    /// Build an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rights: Vec::new(),
            by_command: HashMap::new(),
        }
    }

    /// Look up the right gating a command.
    ///
    /// A miss is a normal outcome; the caller decides what it means via
    /// [`UnmappedCommandPolicy`].
    #[must_use]
    pub fn lookup(&self, command: &Command) -> Option<&AuthorizationRight> {
        self.by_command.get(command).map(|&i| &self.rights[i])
    }

    /// Iterate rights in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &AuthorizationRight> {
        self.rights.iter()
    }

    /// Number of registered rights.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rights.len()
    }

    /// Returns `true` if no rights are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rights() -> Vec<AuthorizationRight> {
        vec![
            AuthorizationRight::constant(
                "flush-cache",
                "com.example.helper.flush-cache",
                "Example helper wants to flush the cache.",
                "allow",
            ),
            AuthorizationRight::admin(
                "rotate-keys",
                "com.example.helper.rotate-keys",
                "Example helper wants to rotate keys.",
            ),
        ]
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let registry = RightsRegistry::new(sample_rights()).unwrap();
        assert_eq!(registry.len(), 2);

        let right = registry.lookup(&Command::from("flush-cache")).unwrap();
        assert_eq!(right.name, "com.example.helper.flush-cache");

        assert!(registry.lookup(&Command::from("unknown")).is_none());
    }

    #[test]
    fn test_declaration_order_preserved() {
        let registry = RightsRegistry::new(sample_rights()).unwrap();
        let names: Vec<_> = registry.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(names, vec!["flush-cache", "rotate-keys"]);
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let mut rights = sample_rights();
        rights.push(AuthorizationRight::admin(
            "flush-cache",
            "com.example.helper.other",
            "Duplicate command.",
        ));
        let err = RightsRegistry::new(rights).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateCommand { .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut rights = sample_rights();
        rights.push(AuthorizationRight::admin(
            "other-command",
            "com.example.helper.flush-cache",
            "Duplicate name.",
        ));
        let err = RightsRegistry::new(rights).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn test_default_admin_constant_name() {
        assert_eq!(
            RightRule::DefaultAdministrator.constant_rule_name(),
            Some(DEFAULT_ADMIN_RULE)
        );
        let custom = RightRule::Custom {
            version: 1,
            definition: BTreeMap::new(),
        };
        assert_eq!(custom.constant_rule_name(), None);
    }

    #[test]
    fn test_rule_serde_round_trip() {
        let rule = RightRule::Constant {
            name: "allow".to_string(),
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains(r#""kind":"constant""#));
        let parsed: RightRule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_unmapped_policy_default_is_deny() {
        assert_eq!(UnmappedCommandPolicy::default(), UnmappedCommandPolicy::Deny);
    }
}
