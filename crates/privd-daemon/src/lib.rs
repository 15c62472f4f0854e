//! privd-daemon: the privileged helper process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  HelperService                      │
//! │   poll loop: sleep(interval) until shutdown signal  │
//! └───────────────┬─────────────────────────────────────┘
//!                 │ spawns
//! ┌───────────────▼─────────────────────────────────────┐
//! │                 HelperListener                      │
//! │  accept ─> PeerCredentials ─> CodeIdentityVerifier  │
//! │     verified peers join the live connection set     │
//! └───────────────┬─────────────────────────────────────┘
//!                 │ per connection
//! ┌───────────────▼─────────────────────────────────────┐
//! │        handshake ─> HelperDispatcher                │
//! │   Authorizer::verify BEFORE PrivilegedHandler       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The daemon binds a Unix domain socket, admits only peers whose
//! executable image matches the expected digest, verifies an
//! authorization credential against the rights registry for every
//! privileged call, and exits when its last connection closes.

pub mod dispatch;
pub mod install;
pub mod listener;
pub mod peer;
pub mod protocol;
pub mod service;

pub use dispatch::{HelperDispatcher, NullHandler, PrivilegedHandler};
pub use install::{install_systemd_unit, InstallError, InstallOptions, InstallReport};
pub use listener::{HelperListener, ListenerConfig};
pub use peer::{CodeIdentityVerifier, IdentityError, PeerCredentials};
pub use service::{HelperService, DEFAULT_POLL_INTERVAL};
