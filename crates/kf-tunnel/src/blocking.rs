//! Blocking front end
//!
//! [`BlockingTunnel`] drives a [`TunnelSession`] on the shared loop, so it
//! can be used from plain threads and from code that is itself running
//! inside some other runtime.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use kf_bridge::CallForwarder;
use kf_core::config::ForwardConfig;
use kf_core::traits::Negotiator;
use kf_core::types::SessionState;
use kf_core::{BridgeError, ForwardSpec, TunnelError};

use crate::connection::ConnectionInfo;
use crate::session::TunnelSession;

/// Forward `spec` and return once the local port is bound
pub fn forward(
    spec: ForwardSpec,
    negotiator: Arc<dyn Negotiator>,
) -> Result<BlockingTunnel, TunnelError> {
    forward_with_config(spec, negotiator, &ForwardConfig::default())
}

/// Like [`forward`], with explicit configuration
pub fn forward_with_config(
    spec: ForwardSpec,
    negotiator: Arc<dyn Negotiator>,
    config: &ForwardConfig,
) -> Result<BlockingTunnel, TunnelError> {
    let tunnel = BlockingTunnel::with_config(spec, negotiator, config)?;
    tunnel.start()?;
    Ok(tunnel)
}

/// A tunnel session controlled from blocking code
///
/// Dropping it stops the session.
pub struct BlockingTunnel {
    session: Arc<TunnelSession>,
    forwarder: CallForwarder,
}

impl BlockingTunnel {
    /// Unstarted tunnel with default configuration
    pub fn new(spec: ForwardSpec, negotiator: Arc<dyn Negotiator>) -> Result<Self, TunnelError> {
        Self::with_config(spec, negotiator, &ForwardConfig::default())
    }

    /// Unstarted tunnel; fails with [`TunnelError::Config`] on invalid settings
    pub fn with_config(
        spec: ForwardSpec,
        negotiator: Arc<dyn Negotiator>,
        config: &ForwardConfig,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self {
            session: Arc::new(TunnelSession::with_config(spec, negotiator, config)),
            forwarder: CallForwarder::with_config(&config.bridge)?,
        })
    }

    /// See [`TunnelSession::start`]
    pub fn start(&self) -> Result<SocketAddr, TunnelError> {
        let session = Arc::clone(&self.session);
        self.forwarder.call(async move { session.start().await }, None)
    }

    /// See [`TunnelSession::stop`]; never fails
    pub fn stop(&self) {
        let session = Arc::clone(&self.session);
        let stopped: Result<(), BridgeError> = self.forwarder.call(
            async move {
                session.stop().await;
                Ok(())
            },
            None,
        );
        if let Err(e) = stopped {
            tracing::warn!("Could not stop on the shared loop ({}), aborting instead", e);
            self.session.abort();
        }
    }

    /// Block until the session stops or fails
    pub fn run_forever(&self) -> Result<(), TunnelError> {
        let session = Arc::clone(&self.session);
        self.forwarder
            .call(async move { session.run_forever().await }, None)
    }

    /// Start, run `body` with the bound address, then stop
    ///
    /// `stop()` runs even if `body` panics; the panic is resumed afterwards.
    pub fn scoped<F, T>(&self, body: F) -> Result<T, TunnelError>
    where
        F: FnOnce(SocketAddr) -> T,
    {
        let addr = match self.start() {
            Ok(addr) => addr,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| body(addr)));
        self.stop();

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.local_addr()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.session.connections()
    }

    /// The underlying cooperative session
    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }
}

impl Drop for BlockingTunnel {
    fn drop(&mut self) {
        self.stop();
    }
}
