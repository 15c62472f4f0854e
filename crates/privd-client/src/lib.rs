//! privd-client: caller-side library for the privd privileged helper.
//!
//! Connects to the helper's Unix domain socket, performs the handshake,
//! and exposes a proxy API for privileged calls. A client maintains at
//! most one live connection, shared by every proxy it hands out; when
//! the connection dies, outstanding calls fail with a channel
//! invalidation error and the next call reconnects transparently.
//!
//! ```no_run
//! use std::sync::Arc;
//! use privd_client::{ClientConfig, HelperClient};
//!
//! # async fn example() -> Result<(), privd_client::ClientError> {
//! let client = HelperClient::new(ClientConfig::new("com.example.helper"));
//! let proxy = client
//!     .remote_proxy(Arc::new(|error| eprintln!("helper channel lost: {error}")))
//!     .await?;
//! let version = proxy.get_version().await?;
//! println!("helper {version}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;

pub use client::{ClientConfig, ErrorHandler, EventHandler, HelperClient, HelperProxy};
pub use error::ClientError;
