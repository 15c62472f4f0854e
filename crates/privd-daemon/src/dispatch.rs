//! Request dispatch: authorization check, then handler invocation.
//!
//! The dispatcher is the single choke point between the wire and privileged
//! work. Every [`HelperRequest::Invoke`] is verified against the rights
//! registry BEFORE the handler sees it; the handler only ever receives
//! commands that carried a valid, authorized credential.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use privd_core::{Authorizer, Command};

use crate::protocol::{HelperCallError, HelperRequest, HelperResponse};

/// Implements the privileged commands the helper exposes.
///
/// Implementations run AFTER authorization has succeeded and must not
/// perform their own credential checks.
#[async_trait]
pub trait PrivilegedHandler: Send + Sync {
    /// Run an authorized command.
    async fn invoke(&self, command: &Command, args: Value) -> Result<Value, HelperCallError>;
}

/// A handler that supports no commands.
///
/// Useful as a placeholder while wiring up a deployment, and in tests that
/// only exercise the authorization path.
#[derive(Debug, Default)]
pub struct NullHandler;

#[async_trait]
impl PrivilegedHandler for NullHandler {
    async fn invoke(&self, command: &Command, _args: Value) -> Result<Value, HelperCallError> {
        Err(HelperCallError::Unsupported {
            message: format!("command {command} is not implemented by this helper"),
        })
    }
}

/// Routes requests to the authorizer and handler.
pub struct HelperDispatcher {
    authorizer: Arc<Authorizer>,
    handler: Arc<dyn PrivilegedHandler>,
    version: String,
}

impl HelperDispatcher {
    /// Create a dispatcher reporting this crate's version.
    #[must_use]
    pub fn new(authorizer: Arc<Authorizer>, handler: Arc<dyn PrivilegedHandler>) -> Self {
        Self {
            authorizer,
            handler,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Override the reported version string.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Process one request to completion.
    ///
    /// Never fails: every failure mode maps to [`HelperResponse::Error`]
    /// so the connection stays usable.
    pub async fn dispatch(&self, request: HelperRequest) -> HelperResponse {
        match request {
            HelperRequest::GetVersion => HelperResponse::Version {
                version: self.version.clone(),
            },
            HelperRequest::Invoke {
                command,
                credential,
                args,
            } => self.invoke(command, &credential, args).await,
        }
    }

    async fn invoke(&self, command: Command, credential: &[u8], args: Value) -> HelperResponse {
        if let Err(error) = self.authorizer.verify(credential, &command) {
            warn!(%command, %error, "authorization failed");
            return HelperResponse::Error {
                error: error.into(),
            };
        }
        debug!(%command, "authorization granted, invoking handler");

        match self.handler.invoke(&command, args).await {
            Ok(result) => HelperResponse::Invoked { command, result },
            Err(error) => {
                warn!(%command, %error, "handler failed");
                HelperResponse::Error { error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use privd_core::{
        AuthorizationRight, Authority, InMemoryAuthority, RightsRegistry, UnmappedCommandPolicy,
        CREDENTIAL_LEN,
    };

    struct CountingHandler {
        invocations: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PrivilegedHandler for CountingHandler {
        async fn invoke(&self, _command: &Command, args: Value) -> Result<Value, HelperCallError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(args)
        }
    }

    fn fixture() -> (Arc<InMemoryAuthority>, HelperDispatcher, Arc<CountingHandler>) {
        let registry = RightsRegistry::new(vec![AuthorizationRight::constant(
            "flush-cache",
            "test.flush-cache",
            "flush the cache",
            "allow",
        )])
        .unwrap();
        let authority = Arc::new(InMemoryAuthority::new());
        let authorizer = Arc::new(Authorizer::new(
            registry,
            UnmappedCommandPolicy::Deny,
            Arc::clone(&authority) as Arc<dyn Authority>,
        ));
        let handler = CountingHandler::new();
        let dispatcher = HelperDispatcher::new(
            authorizer,
            Arc::clone(&handler) as Arc<dyn PrivilegedHandler>,
        );
        (authority, dispatcher, handler)
    }

    #[tokio::test]
    async fn test_get_version_needs_no_credential() {
        let (_, dispatcher, _) = fixture();
        let response = dispatcher.dispatch(HelperRequest::GetVersion).await;
        assert!(matches!(
            response,
            HelperResponse::Version { version } if version == env!("CARGO_PKG_VERSION")
        ));
    }

    #[tokio::test]
    async fn test_authorized_invoke_reaches_handler() {
        let (authority, dispatcher, handler) = fixture();
        let credential = authority.create_credential().unwrap();

        let response = dispatcher
            .dispatch(HelperRequest::Invoke {
                command: Command::from("flush-cache"),
                credential: credential.to_vec(),
                args: serde_json::json!({ "scope": "all" }),
            })
            .await;

        assert!(matches!(
            response,
            HelperResponse::Invoked { result, .. } if result["scope"] == "all"
        ));
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_short_credential_never_reaches_handler() {
        let (_, dispatcher, handler) = fixture();

        let response = dispatcher
            .dispatch(HelperRequest::Invoke {
                command: Command::from("flush-cache"),
                credential: vec![0u8; 4],
                args: Value::Null,
            })
            .await;

        assert!(matches!(
            response,
            HelperResponse::Error {
                error: HelperCallError::InvalidCredential
            }
        ));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_denied() {
        let (authority, dispatcher, handler) = fixture();
        let credential = authority.create_credential().unwrap();

        let response = dispatcher
            .dispatch(HelperRequest::Invoke {
                command: Command::from("not-registered"),
                credential: credential.to_vec(),
                args: Value::Null,
            })
            .await;

        assert!(matches!(
            response,
            HelperResponse::Error {
                error: HelperCallError::UnknownCommand { command }
            } if command == "not-registered"
        ));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_denied_right_never_reaches_handler() {
        let (authority, dispatcher, handler) = fixture();
        authority.deny_right("test.flush-cache");
        let credential = authority.create_credential().unwrap();

        let response = dispatcher
            .dispatch(HelperRequest::Invoke {
                command: Command::from("flush-cache"),
                credential: credential.to_vec(),
                args: Value::Null,
            })
            .await;

        assert!(matches!(
            response,
            HelperResponse::Error {
                error: HelperCallError::AuthorizationDenied
            }
        ));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_unminted_credential_rejected() {
        let (_, dispatcher, handler) = fixture();

        let response = dispatcher
            .dispatch(HelperRequest::Invoke {
                command: Command::from("flush-cache"),
                credential: vec![0xFF; CREDENTIAL_LEN],
                args: Value::Null,
            })
            .await;

        assert!(matches!(
            response,
            HelperResponse::Error {
                error: HelperCallError::CredentialDecodeFailed
            }
        ));
        assert_eq!(handler.count(), 0);
    }
}
