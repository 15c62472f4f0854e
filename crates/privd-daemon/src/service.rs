//! Helper lifecycle: run the listener, poll for quiescence, exit.
//!
//! The helper is an on-demand process: it serves connections while it has
//! them and exits once the last one closes. The lifecycle controller
//! spawns the accept loop and then polls the shutdown signal on a fixed
//! interval (default one second); when the signal is raised, either
//! because the live set emptied or because shutdown was requested
//! explicitly, the controller waits for the accept loop and returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::dispatch::HelperDispatcher;
use crate::listener::HelperListener;
use crate::peer::CodeIdentityVerifier;
use crate::protocol::{ProtocolError, ProtocolResult};

/// Default interval between shutdown polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the helper from startup to quiescent exit.
pub struct HelperService {
    listener: Arc<HelperListener>,
    verifier: Arc<CodeIdentityVerifier>,
    dispatcher: Arc<HelperDispatcher>,
    poll_interval: Duration,
}

impl HelperService {
    /// Assemble the service with the default poll interval.
    #[must_use]
    pub fn new(
        listener: Arc<HelperListener>,
        verifier: Arc<CodeIdentityVerifier>,
        dispatcher: Arc<HelperDispatcher>,
    ) -> Self {
        Self {
            listener,
            verifier,
            dispatcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the shutdown poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The listener this service drives.
    #[must_use]
    pub fn listener(&self) -> &Arc<HelperListener> {
        &self.listener
    }

    /// Run until the shutdown signal is raised.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the accept loop fails fatally.
    pub async fn run(self) -> ProtocolResult<()> {
        let mut shutdown_rx = self.listener.shutdown_signal();

        let accept_loop = tokio::spawn(
            Arc::clone(&self.listener).run(Arc::clone(&self.verifier), Arc::clone(&self.dispatcher)),
        );

        loop {
            sleep(self.poll_interval).await;
            if *shutdown_rx.borrow_and_update() {
                break;
            }
        }

        match accept_loop.await {
            Ok(result) => result?,
            Err(error) => {
                warn!(%error, "accept loop task failed");
                return Err(ProtocolError::Io(std::io::Error::other(error)));
            }
        }

        info!("helper quiescent, exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NullHandler;
    use crate::listener::ListenerConfig;
    use privd_core::{Authority, Authorizer, InMemoryAuthority, RightsRegistry, UnmappedCommandPolicy};

    fn dispatcher() -> Arc<HelperDispatcher> {
        let authority: Arc<dyn Authority> = Arc::new(InMemoryAuthority::new());
        Arc::new(HelperDispatcher::new(
            Arc::new(Authorizer::new(
                RightsRegistry::empty(),
                UnmappedCommandPolicy::Deny,
                authority,
            )),
            Arc::new(NullHandler),
        ))
    }

    #[tokio::test]
    async fn test_explicit_shutdown_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = ListenerConfig::new("svc").with_socket_path(dir.path().join("svc.sock"));
        let listener = Arc::new(HelperListener::bind(config).unwrap());
        let verifier = Arc::new(CodeIdentityVerifier::for_current_exe().unwrap());

        let service = HelperService::new(Arc::clone(&listener), verifier, dispatcher())
            .with_poll_interval(Duration::from_millis(20));

        let handle = tokio::spawn(service.run());
        listener.request_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("service must exit after shutdown request")
            .unwrap();
        assert!(result.is_ok());
    }
}
