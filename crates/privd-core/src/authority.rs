//! Client for the system-wide security authority.
//!
//! The authority is the external service that stores authorization rights
//! and can prompt the user for consent. This module defines the boundary
//! trait, the idempotent synchronization of declared rights against the
//! authority's database, and the per-call verifier that privileged
//! operations run before doing anything.
//!
//! # Synchronization Semantics
//!
//! [`synchronize_rights`] walks the registry in declaration order. A right
//! is written only when the authority has no record for it or the stored
//! record is stale ([`update_required`]); the comparison differs by rule
//! variant and defaults to "changed" on any shape mismatch, failing toward
//! re-registration rather than trusting stale state. Per-right failures are
//! logged and recorded; one right's failure never aborts the rest of the
//! batch.
//!
//! # Verification
//!
//! [`Authorizer::verify`] validates the credential's length before anything
//! else, internalizes it through the authority, resolves the command's
//! right, and asks the authority to extend rights for it. The authority
//! call may block on interactive user authentication; that is an expected
//! suspension point, not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::credential::{AuthorizationCredential, CREDENTIAL_LEN};
use crate::error::{AuthError, AuthorityError};
use crate::rights::{
    AuthorizationRight, Command, RightRule, RightsRegistry, UnmappedCommandPolicy,
};

/// Opaque authority-native reference to an internalized credential.
///
/// Produced by [`Authority::internalize`] and consumed by
/// [`Authority::authorize`]; valid for a single verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialRef(u64);

impl CredentialRef {
    /// Construct a reference from an authority-assigned raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the authority-assigned raw value.
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

/// The authority's stored representation of one right.
///
/// Only the fields relevant to the update decision are modeled: the list of
/// referenced rule names (constant rules) and the rule version (custom
/// rules). Anything else the authority stores is opaque here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityRecord {
    /// Names of the built-in rules this right currently references.
    pub rule_names: Vec<String>,
    /// Stored version of a custom rule definition, if any.
    pub version: Option<u64>,
}

impl AuthorityRecord {
    /// Build the record a freshly written rule would produce.
    #[must_use]
    pub fn from_rule(rule: &RightRule) -> Self {
        match rule {
            RightRule::Custom { version, .. } => Self {
                rule_names: Vec::new(),
                version: Some(*version),
            },
            other => Self {
                rule_names: other
                    .constant_rule_name()
                    .map(|name| vec![name.to_string()])
                    .unwrap_or_default(),
                version: None,
            },
        }
    }
}

/// Boundary to the system-wide security authority.
///
/// Implementations must be safe to share across the helper's connection
/// tasks. [`Authority::authorize`] may block awaiting interactive user
/// confirmation when `allow_interaction` is set.
pub trait Authority: Send + Sync {
    /// Fetch the current record for a right, if the authority has one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the authority cannot be queried.
    fn fetch_right(&self, name: &str) -> Result<Option<AuthorityRecord>, AuthorityError>;

    /// Write (create or replace) a right definition.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Failure`] with an opaque status code on
    /// failure.
    fn set_right(
        &self,
        name: &str,
        rule: &RightRule,
        description: &str,
    ) -> Result<(), AuthorityError>;

    /// Convert a credential's external form into an authority-native
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::MalformedCredential`] if the blob is not a
    /// credential this authority minted.
    fn internalize(
        &self,
        credential: &AuthorizationCredential,
    ) -> Result<CredentialRef, AuthorityError>;

    /// Ask the authority to authenticate and extend rights for `right_name`.
    ///
    /// May block on a system consent prompt when `allow_interaction` is set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Denied`] when the user or policy denies the
    /// request.
    fn authorize(
        &self,
        reference: &CredentialRef,
        right_name: &str,
        allow_interaction: bool,
    ) -> Result<(), AuthorityError>;

    /// Mint a fresh credential in external form.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the authority cannot mint credentials.
    fn create_credential(&self) -> Result<AuthorizationCredential, AuthorityError>;
}

/// Decide whether a stored right must be rewritten.
///
/// Tie-break rules:
/// - absent record: update required
/// - constant rule (including the default-administrator fallback): changed
///   iff the stored rule list differs from the single wanted rule name
/// - custom rule: changed iff the stored version differs (or is absent)
/// - any other shape mismatch: changed (fail toward re-registration)
#[must_use]
pub fn update_required(current: Option<&AuthorityRecord>, wanted: &AuthorizationRight) -> bool {
    let Some(current) = current else {
        return true;
    };

    match &wanted.rule {
        RightRule::Custom { version, .. } => current.version != Some(*version),
        rule => match rule.constant_rule_name() {
            Some(name) => current.rule_names.len() != 1 || current.rule_names[0] != name,
            None => true,
        },
    }
}

/// Outcome of synchronizing one right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The stored record already matched; no write performed.
    Unchanged {
        /// Right name.
        name: String,
    },
    /// The right was written (created or replaced).
    Updated {
        /// Right name.
        name: String,
    },
    /// Fetching or writing this right failed; the batch continued.
    Failed {
        /// Right name.
        name: String,
        /// The authority failure.
        error: AuthorityError,
    },
}

impl SyncOutcome {
    /// Right name this outcome refers to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Unchanged { name } | Self::Updated { name } | Self::Failed { name, .. } => name,
        }
    }

    /// Returns `true` if this right failed to synchronize.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Synchronize declared rights into the authority's database.
///
/// Walks the registry in declaration order and writes each right only when
/// missing or stale. Per-right failures are logged and collected; the batch
/// always runs to completion.
pub fn synchronize_rights(authority: &dyn Authority, registry: &RightsRegistry) -> Vec<SyncOutcome> {
    let mut outcomes = Vec::with_capacity(registry.len());

    for right in registry.iter() {
        let current = match authority.fetch_right(&right.name) {
            Ok(current) => current,
            Err(error) => {
                warn!(right = %right.name, %error, "Failed to fetch right from authority");
                outcomes.push(SyncOutcome::Failed {
                    name: right.name.clone(),
                    error,
                });
                continue;
            }
        };

        if !update_required(current.as_ref(), right) {
            debug!(right = %right.name, "Right already current");
            outcomes.push(SyncOutcome::Unchanged {
                name: right.name.clone(),
            });
            continue;
        }

        match authority.set_right(&right.name, &right.rule, &right.description) {
            Ok(()) => {
                debug!(right = %right.name, "Wrote right definition");
                outcomes.push(SyncOutcome::Updated {
                    name: right.name.clone(),
                });
            }
            Err(error) => {
                warn!(right = %right.name, %error, "Failed to write right definition");
                outcomes.push(SyncOutcome::Failed {
                    name: right.name.clone(),
                    error,
                });
            }
        }
    }

    outcomes
}

/// Per-call verifier gating privileged commands.
///
/// Owns the registry and the unmapped-command policy; delegates the actual
/// accept/deny decision to the authority.
pub struct Authorizer {
    registry: RightsRegistry,
    policy: UnmappedCommandPolicy,
    authority: Arc<dyn Authority>,
}

impl Authorizer {
    /// Create a verifier over a registry and an authority.
    #[must_use]
    pub fn new(
        registry: RightsRegistry,
        policy: UnmappedCommandPolicy,
        authority: Arc<dyn Authority>,
    ) -> Self {
        Self {
            registry,
            policy,
            authority,
        }
    }

    /// Returns the registry this verifier consults.
    #[must_use]
    pub fn registry(&self) -> &RightsRegistry {
        &self.registry
    }

    /// Synchronize this verifier's rights into the authority.
    pub fn synchronize(&self) -> Vec<SyncOutcome> {
        synchronize_rights(self.authority.as_ref(), &self.registry)
    }

    /// Verify a caller-supplied credential against the right for `command`.
    ///
    /// The credential length is checked before the authority is consulted.
    /// The authority call may block on interactive user authentication.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredential`]: blob length is wrong
    /// - [`AuthError::CredentialDecodeFailed`]: blob cannot be internalized
    /// - [`AuthError::UnknownCommand`]: no right registered and the policy
    ///   denies unmapped commands
    /// - [`AuthError::AuthorizationDenied`]: the authority denied the request
    pub fn verify(&self, credential_bytes: &[u8], command: &Command) -> Result<(), AuthError> {
        if credential_bytes.len() != CREDENTIAL_LEN {
            return Err(AuthError::InvalidCredential {
                len: credential_bytes.len(),
                expected: CREDENTIAL_LEN,
            });
        }

        // Length was checked above, so only an internalization failure can
        // surface from here on.
        let credential = AuthorizationCredential::from_bytes(credential_bytes)
            .map_err(|_| AuthError::CredentialDecodeFailed)?;

        let reference = self
            .authority
            .internalize(&credential)
            .map_err(|_| AuthError::CredentialDecodeFailed)?;

        let Some(right) = self.registry.lookup(command) else {
            return match self.policy {
                UnmappedCommandPolicy::Deny => Err(AuthError::UnknownCommand {
                    command: command.as_str().to_string(),
                }),
                UnmappedCommandPolicy::Allow => Ok(()),
            };
        };

        self.authority
            .authorize(&reference, &right.name, true)
            .map_err(|error| match error {
                AuthorityError::Denied => AuthError::AuthorizationDenied,
                other => AuthError::Authority(other),
            })
    }
}

/// Stored state for one right inside [`InMemoryAuthority`].
#[derive(Debug, Clone)]
struct StoredRight {
    record: AuthorityRecord,
    #[allow(dead_code)]
    description: String,
}

/// Process-local authority backed by a mutexed map.
///
/// Used by tests and by deployments without a reachable system authority.
/// Counts writes so synchronization idempotence is observable, and counts
/// authorize calls so short-circuit behavior is observable.
#[derive(Default)]
pub struct InMemoryAuthority {
    rights: Mutex<HashMap<String, StoredRight>>,
    issued: Mutex<HashMap<Vec<u8>, u64>>,
    denied_rights: Mutex<Vec<String>>,
    next_ref: AtomicU64,
    write_count: AtomicUsize,
    authorize_count: AtomicUsize,
}

impl InMemoryAuthority {
    /// Create an empty authority that grants every authorize request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a right as denied: authorize requests against it fail with
    /// [`AuthorityError::Denied`].
    pub fn deny_right(&self, name: impl Into<String>) {
        self.denied_rights
            .lock()
            .expect("denied rights lock poisoned")
            .push(name.into());
    }

    /// Number of `set_right` writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of `authorize` calls performed so far.
    #[must_use]
    pub fn authorize_count(&self) -> usize {
        self.authorize_count.load(Ordering::SeqCst)
    }

    /// Replace the stored record for a right, bypassing the write counter.
    ///
    /// Simulates external drift in the authority's database.
    pub fn put_record(&self, name: impl Into<String>, record: AuthorityRecord) {
        self.rights.lock().expect("rights lock poisoned").insert(
            name.into(),
            StoredRight {
                record,
                description: String::new(),
            },
        );
    }
}

impl Authority for InMemoryAuthority {
    fn fetch_right(&self, name: &str) -> Result<Option<AuthorityRecord>, AuthorityError> {
        Ok(self
            .rights
            .lock()
            .expect("rights lock poisoned")
            .get(name)
            .map(|stored| stored.record.clone()))
    }

    fn set_right(
        &self,
        name: &str,
        rule: &RightRule,
        description: &str,
    ) -> Result<(), AuthorityError> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.rights.lock().expect("rights lock poisoned").insert(
            name.to_string(),
            StoredRight {
                record: AuthorityRecord::from_rule(rule),
                description: description.to_string(),
            },
        );
        Ok(())
    }

    fn internalize(
        &self,
        credential: &AuthorizationCredential,
    ) -> Result<CredentialRef, AuthorityError> {
        self.issued
            .lock()
            .expect("issued lock poisoned")
            .get(credential.as_bytes())
            .map(|&raw| CredentialRef::from_raw(raw))
            .ok_or(AuthorityError::MalformedCredential)
    }

    fn authorize(
        &self,
        _reference: &CredentialRef,
        right_name: &str,
        _allow_interaction: bool,
    ) -> Result<(), AuthorityError> {
        self.authorize_count.fetch_add(1, Ordering::SeqCst);
        let denied = self
            .denied_rights
            .lock()
            .expect("denied rights lock poisoned")
            .iter()
            .any(|name| name == right_name);
        if denied {
            Err(AuthorityError::Denied)
        } else {
            Ok(())
        }
    }

    fn create_credential(&self) -> Result<AuthorizationCredential, AuthorityError> {
        let raw = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; CREDENTIAL_LEN];
        bytes[..8].copy_from_slice(&raw.to_be_bytes());
        let credential = AuthorizationCredential::from_array(bytes);
        self.issued
            .lock()
            .expect("issued lock poisoned")
            .insert(credential.to_vec(), raw);
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::rights::DEFAULT_ADMIN_RULE;

    fn sample_registry() -> RightsRegistry {
        RightsRegistry::new(vec![
            AuthorizationRight::constant(
                "flush-cache",
                "com.example.helper.flush-cache",
                "Example helper wants to flush the cache.",
                "allow",
            ),
            AuthorizationRight::custom(
                "rotate-keys",
                "com.example.helper.rotate-keys",
                "Example helper wants to rotate keys.",
                3,
                BTreeMap::new(),
            ),
            AuthorizationRight::admin(
                "erase-disk",
                "com.example.helper.erase-disk",
                "Example helper wants to erase a disk.",
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_synchronize_writes_missing_rights() {
        let authority = InMemoryAuthority::new();
        let outcomes = synchronize_rights(&authority, &sample_registry());

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SyncOutcome::Updated { .. })));
        assert_eq!(authority.write_count(), 3);
    }

    #[test]
    fn test_synchronize_is_idempotent() {
        let authority = InMemoryAuthority::new();
        let registry = sample_registry();

        synchronize_rights(&authority, &registry);
        let writes_after_first = authority.write_count();

        let outcomes = synchronize_rights(&authority, &registry);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SyncOutcome::Unchanged { .. })));
        assert_eq!(
            authority.write_count(),
            writes_after_first,
            "second synchronize must perform zero writes"
        );
    }

    #[test]
    fn test_synchronize_rewrites_after_external_drift() {
        let authority = InMemoryAuthority::new();
        let registry = sample_registry();
        synchronize_rights(&authority, &registry);

        // External change: someone replaced the constant rule.
        authority.put_record(
            "com.example.helper.flush-cache",
            AuthorityRecord {
                rule_names: vec!["deny".to_string()],
                version: None,
            },
        );

        let outcomes = synchronize_rights(&authority, &registry);
        let flush = outcomes
            .iter()
            .find(|o| o.name() == "com.example.helper.flush-cache")
            .unwrap();
        assert!(matches!(flush, SyncOutcome::Updated { .. }));
    }

    #[test]
    fn test_update_required_tie_break() {
        let constant = AuthorizationRight::constant("c", "r.c", "d", "allow");
        let custom =
            AuthorizationRight::custom("k", "r.k", "d", 2, BTreeMap::new());
        let admin = AuthorizationRight::admin("a", "r.a", "d");

        // Absent record: update required.
        assert!(update_required(None, &constant));

        // Constant rule, unchanged single name: no update.
        let stored = AuthorityRecord {
            rule_names: vec!["allow".to_string()],
            version: None,
        };
        assert!(!update_required(Some(&stored), &constant));

        // Constant rule, different name: update.
        let stored = AuthorityRecord {
            rule_names: vec!["deny".to_string()],
            version: None,
        };
        assert!(update_required(Some(&stored), &constant));

        // Custom rule, same version: no update.
        let stored = AuthorityRecord {
            rule_names: Vec::new(),
            version: Some(2),
        };
        assert!(!update_required(Some(&stored), &custom));

        // Custom rule, version changed: update.
        let stored = AuthorityRecord {
            rule_names: Vec::new(),
            version: Some(1),
        };
        assert!(update_required(Some(&stored), &custom));

        // Shape mismatch (constant record for a custom rule): update.
        let stored = AuthorityRecord {
            rule_names: vec!["allow".to_string()],
            version: None,
        };
        assert!(update_required(Some(&stored), &custom));

        // Default administrator behaves as a constant rule.
        let stored = AuthorityRecord {
            rule_names: vec![DEFAULT_ADMIN_RULE.to_string()],
            version: None,
        };
        assert!(!update_required(Some(&stored), &admin));
    }

    #[test]
    fn test_verify_rejects_wrong_length_before_authority() {
        let authority = Arc::new(InMemoryAuthority::new());
        let authorizer = Authorizer::new(
            sample_registry(),
            UnmappedCommandPolicy::Deny,
            Arc::clone(&authority) as Arc<dyn Authority>,
        );

        let err = authorizer
            .verify(&[0u8; 5], &Command::from("flush-cache"))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential { len: 5, .. }));
        assert_eq!(
            authority.authorize_count(),
            0,
            "authority must not be consulted for a bad-length credential"
        );
    }

    #[test]
    fn test_verify_rejects_unminted_credential() {
        let authority = Arc::new(InMemoryAuthority::new());
        let authorizer = Authorizer::new(
            sample_registry(),
            UnmappedCommandPolicy::Deny,
            Arc::clone(&authority) as Arc<dyn Authority>,
        );

        let err = authorizer
            .verify(&[0u8; CREDENTIAL_LEN], &Command::from("flush-cache"))
            .unwrap_err();
        assert!(matches!(err, AuthError::CredentialDecodeFailed));
    }

    #[test]
    fn test_verify_unknown_command_policies() {
        let authority = Arc::new(InMemoryAuthority::new());
        let credential = authority.create_credential().unwrap();

        let deny = Authorizer::new(
            sample_registry(),
            UnmappedCommandPolicy::Deny,
            Arc::clone(&authority) as Arc<dyn Authority>,
        );
        let err = deny
            .verify(credential.as_bytes(), &Command::from("unmapped"))
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownCommand { .. }));

        let allow = Authorizer::new(
            sample_registry(),
            UnmappedCommandPolicy::Allow,
            Arc::clone(&authority) as Arc<dyn Authority>,
        );
        allow
            .verify(credential.as_bytes(), &Command::from("unmapped"))
            .unwrap();
    }

    #[test]
    fn test_verify_grant_and_deny() {
        let authority = Arc::new(InMemoryAuthority::new());
        let credential = authority.create_credential().unwrap();
        authority.deny_right("com.example.helper.erase-disk");

        let authorizer = Authorizer::new(
            sample_registry(),
            UnmappedCommandPolicy::Deny,
            Arc::clone(&authority) as Arc<dyn Authority>,
        );

        authorizer
            .verify(credential.as_bytes(), &Command::from("flush-cache"))
            .unwrap();

        let err = authorizer
            .verify(credential.as_bytes(), &Command::from("erase-disk"))
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationDenied));
        assert!(err.is_denial());
    }

    #[test]
    fn test_record_from_rule() {
        let record = AuthorityRecord::from_rule(&RightRule::DefaultAdministrator);
        assert_eq!(record.rule_names, vec![DEFAULT_ADMIN_RULE.to_string()]);
        assert_eq!(record.version, None);

        let record = AuthorityRecord::from_rule(&RightRule::Custom {
            version: 9,
            definition: BTreeMap::new(),
        });
        assert!(record.rule_names.is_empty());
        assert_eq!(record.version, Some(9));
    }
}
