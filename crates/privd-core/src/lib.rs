//! privd-core - Authorization model for the privd privileged helper.
//!
//! This crate holds the pieces of the helper that are independent of any
//! transport: the declarative registry of named authorization rights, the
//! opaque credential exchanged across the IPC boundary, and the client for
//! the system-wide security authority that stores and enforces those rights.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │  RightsRegistry  │────▶│    Authorizer    │────▶│  dyn Authority   │
//! │ (command→right)  │     │ (verify per call)│     │ (system service) │
//! └──────────────────┘     └──────────────────┘     └──────────────────┘
//!                                  ▲
//!                                  │ credential (opaque 32-byte blob)
//!                            caller-supplied
//! ```
//!
//! # Module Overview
//!
//! - [`rights`]: Right definitions and the construction-time registry
//! - [`credential`]: Fixed-length opaque authorization credential
//! - [`authority`]: Authority boundary trait, synchronization, verification
//! - [`config`]: Helper configuration loaded from TOML
//! - [`error`]: Shared error taxonomy ([`AuthError`], [`AuthorityError`])
//!
//! # Security Considerations
//!
//! - Rights are immutable after construction; there is no mutation API
//! - Credential length is validated before the authority is consulted
//! - Authorization denials are never upgraded to success; per-right
//!   synchronization failures never abort the surrounding batch

pub mod authority;
pub mod config;
pub mod credential;
pub mod error;
pub mod rights;

pub use authority::{
    synchronize_rights, update_required, Authority, AuthorityRecord, Authorizer, CredentialRef,
    InMemoryAuthority, SyncOutcome,
};
pub use config::{default_socket_path, ConfigError, HelperConfig, RightConfig};
pub use credential::{AuthorizationCredential, CREDENTIAL_LEN};
pub use error::{AuthError, AuthorityError};
pub use rights::{
    AuthorizationRight, Command, RegistryError, RightRule, RightsRegistry, UnmappedCommandPolicy,
    DEFAULT_ADMIN_RULE,
};
