//! Tunnel sessions
//!
//! A [`TunnelSession`] ties one forward spec to one multiplexed transport
//! and the local listeners feeding it.
//!
//! # Lifecycle
//!
//! ```text
//! Ready -> Starting -> Running -> Stopping -> Stopped
//!              \           \
//!               +-> Failed  +-> Failed (transport lost, channels exhausted)
//! ```
//!
//! `stop()` is accepted in every state and always ends in `Stopped`.
//!
//! # Cancellation
//!
//! All background work hangs off one token tree. `shutdown` is cancelled
//! by `stop()`; `work` (a child) by a session failure; `accepting` (a
//! child of `work`) also when channel ids run out. Connection tokens are
//! children of `work`, so exhaustion stops accepting but leaves open
//! connections flowing.

mod accept;
mod retry;

pub use retry::negotiate_with_retry;

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use kf_core::config::{BackoffConfig, ForwardConfig, TunnelConfig};
use kf_core::traits::{DiagnosticsSink, Negotiator, TracingDiagnostics};
use kf_core::types::SessionState;
use kf_core::{ConnectionId, ForwardSpec, TunnelError};

use crate::connection::{ConnectionHandle, ConnectionInfo};
use crate::listener::LocalListener;
use crate::mux::ChannelMultiplexer;

/// Builder for [`TunnelSession`]
pub struct SessionBuilder {
    spec: ForwardSpec,
    negotiator: Arc<dyn Negotiator>,
    tunnel: TunnelConfig,
    backoff: BackoffConfig,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl SessionBuilder {
    /// Use the tunnel and retry sections of `config`
    pub fn config(mut self, config: &ForwardConfig) -> Self {
        self.tunnel = config.tunnel.clone();
        self.backoff = config.backoff.clone();
        self
    }

    /// Multiplexer and listener settings
    pub fn tunnel_config(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Negotiation retry settings
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Where connection events go
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn build(self) -> TunnelSession {
        let shutdown = CancellationToken::new();
        let work = shutdown.child_token();
        let accepting = work.child_token();
        let (state, _) = watch::channel(SessionState::Ready);

        TunnelSession {
            inner: Arc::new(SessionInner {
                spec: self.spec,
                negotiator: self.negotiator,
                config: self.tunnel,
                backoff: self.backoff,
                diagnostics: self.diagnostics,
                state,
                failure: Mutex::new(None),
                bound: Mutex::new(Vec::new()),
                control: tokio::sync::Mutex::new(Control::default()),
                shutdown,
                work,
                accepting,
                connections: DashMap::new(),
                next_connection: AtomicU64::new(1),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

#[derive(Default)]
struct Control {
    mux: Option<Arc<ChannelMultiplexer>>,
}

pub(crate) struct SessionInner {
    spec: ForwardSpec,
    negotiator: Arc<dyn Negotiator>,
    config: TunnelConfig,
    backoff: BackoffConfig,
    diagnostics: Arc<dyn DiagnosticsSink>,
    state: watch::Sender<SessionState>,
    failure: Mutex<Option<String>>,
    bound: Mutex<Vec<SocketAddr>>,
    /// Serializes `start()` and `stop()`
    control: tokio::sync::Mutex<Control>,
    shutdown: CancellationToken,
    work: CancellationToken,
    accepting: CancellationToken,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_connection: AtomicU64,
    tasks: TaskTracker,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(%prev, %next, "Session state changed");
        }
    }

    /// Record a failure and tear down listeners and connections
    pub(crate) fn fail(&self, reason: String) {
        let changed = self.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Starting | SessionState::Running) {
                // Recorded before watchers can observe `Failed`
                *lock(&self.failure) = Some(reason.clone());
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::error!(forward = %self.spec.target(), "Session failed: {}", reason);
        }
    }

    async fn bring_up(self: &Arc<Self>, control: &mut Control) -> Result<SocketAddr, TunnelError> {
        // Rejected before anything is negotiated or bound
        self.config.validate()?;
        self.backoff.validate()?;

        let target = self.spec.target();
        let remote_port = self.spec.remote_port();

        let transport = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TunnelError::TunnelClosed),
            negotiated = negotiate_with_retry(self.negotiator.as_ref(), target, remote_port, &self.backoff) => negotiated?,
        };

        let mux = Arc::new(ChannelMultiplexer::new(transport, remote_port, &self.config));

        let bound = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::TunnelClosed),
            bound = LocalListener::bind(self.spec.addresses(), self.spec.local_port()) => bound,
        };
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                mux.close().await;
                return Err(e);
            }
        };

        let addrs = listener.local_addrs().to_vec();
        for socket in listener.into_listeners() {
            self.tasks
                .spawn(accept::accept_loop(Arc::clone(self), socket, Arc::clone(&mux)));
        }
        self.tasks.spawn(supervise(Arc::clone(self), mux.lost_signal()));

        *lock(&self.bound) = addrs.clone();
        control.mux = Some(mux);

        tracing::info!(
            forward = %target,
            remote_port,
            local = ?addrs,
            "Port forward running"
        );
        Ok(addrs[0])
    }
}

/// Fails the session if the transport goes away underneath it
async fn supervise(inner: Arc<SessionInner>, lost: CancellationToken) {
    tokio::select! {
        _ = inner.shutdown.cancelled() => {}
        _ = lost.cancelled() => {
            inner.fail("lost connection to the remote".to_string());
            inner.work.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One port forward: local listeners multiplexed over one upgraded transport
pub struct TunnelSession {
    inner: Arc<SessionInner>,
}

impl TunnelSession {
    /// Session with default configuration
    pub fn new(spec: ForwardSpec, negotiator: Arc<dyn Negotiator>) -> Self {
        Self::builder(spec, negotiator).build()
    }

    /// Session using the tunnel and retry sections of `config`
    pub fn with_config(
        spec: ForwardSpec,
        negotiator: Arc<dyn Negotiator>,
        config: &ForwardConfig,
    ) -> Self {
        Self::builder(spec, negotiator).config(config).build()
    }

    pub fn builder(spec: ForwardSpec, negotiator: Arc<dyn Negotiator>) -> SessionBuilder {
        SessionBuilder {
            spec,
            negotiator,
            tunnel: TunnelConfig::default(),
            backoff: BackoffConfig::default(),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Negotiate the transport, bind and start accepting
    ///
    /// Returns the first bound address. Calling it again while running
    /// returns the same address without binding anything new.
    pub async fn start(&self) -> Result<SocketAddr, TunnelError> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;

        match inner.state() {
            SessionState::Ready => {}
            SessionState::Running => {
                return lock(&inner.bound)
                    .first()
                    .copied()
                    .ok_or(TunnelError::TunnelClosed);
            }
            other => return Err(TunnelError::NotStartable(other)),
        }

        // stop() may have run before we got the lock
        if inner.shutdown.is_cancelled() {
            return Err(TunnelError::TunnelClosed);
        }

        inner.set_state(SessionState::Starting);
        tracing::debug!(spec = ?inner.spec, "Starting session");

        match inner.bring_up(&mut control).await {
            Ok(addr) => {
                inner.state.send_if_modified(|state| {
                    let starting = *state == SessionState::Starting;
                    if starting {
                        *state = SessionState::Running;
                    }
                    starting
                });
                Ok(addr)
            }
            Err(_) if inner.shutdown.is_cancelled() => Err(TunnelError::TunnelClosed),
            Err(e) => {
                inner.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop accepting, close every connection and the transport
    ///
    /// Safe in any state and idempotent. Waits at most the configured
    /// stop grace for connections to unwind; never fails.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let grace = inner.config.stop_grace;
        let mut control = match tokio::time::timeout(grace, inner.control.lock()).await {
            Ok(control) => Some(control),
            Err(_) => {
                tracing::warn!("start() did not yield within {:?}, stopping anyway", grace);
                None
            }
        };

        if inner.state() == SessionState::Stopped {
            return;
        }
        inner.set_state(SessionState::Stopping);

        inner.tasks.close();
        if tokio::time::timeout(grace, inner.tasks.wait()).await.is_err() {
            tracing::warn!(
                remaining = inner.tasks.len(),
                "Connections did not finish within {:?}",
                grace
            );
        }

        if let Some(mux) = control.as_mut().and_then(|c| c.mux.take()) {
            mux.close().await;
        }
        inner.connections.clear();
        lock(&inner.bound).clear();

        inner.set_state(SessionState::Stopped);
        tracing::info!(forward = %inner.spec.target(), "Port forward stopped");
    }

    /// Start if needed, then wait until the session stops or fails
    ///
    /// Returns `Ok(())` once stopped, or `SessionFailed` with the recorded
    /// reason. Dropping the future stops waiting but leaves the session
    /// running.
    pub async fn run_forever(&self) -> Result<(), TunnelError> {
        if self.state() == SessionState::Ready {
            self.start().await?;
        }

        let mut states = self.inner.state.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                SessionState::Stopped => return Ok(()),
                SessionState::Failed => {
                    return Err(TunnelError::SessionFailed(
                        self.failure_reason()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    ))
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Start, run `body` with the bound address, then stop
    ///
    /// `stop()` runs even if `body` panics; the panic is resumed afterwards.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> Result<T, TunnelError>
    where
        F: FnOnce(SocketAddr) -> Fut,
        Fut: Future<Output = T>,
    {
        let addr = match self.start().await {
            Ok(addr) => addr,
            Err(e) => {
                self.stop().await;
                return Err(e);
            }
        };

        let outcome = AssertUnwindSafe(async move { body(addr).await })
            .catch_unwind()
            .await;
        self.stop().await;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Best-effort synchronous teardown
    ///
    /// Cancels all background work and force-closes the transport without
    /// waiting for anything.
    pub fn abort(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();
        if let Ok(mut control) = inner.control.try_lock() {
            if let Some(mux) = control.mux.take() {
                mux.force_close();
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// First bound local address, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).first().copied()
    }

    /// All bound local addresses
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.inner.bound).clone()
    }

    /// Snapshot of active connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Why the session failed, if it did
    pub fn failure_reason(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.inner.spec
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if !matches!(self.state(), SessionState::Stopped | SessionState::Ready) {
            tracing::debug!("Session dropped while {}, aborting", self.state());
        }
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kf_core::traits::BoxedTransport;
    use kf_core::{NegotiationError, Target};
    use std::time::Duration;

    struct NeverNegotiates;

    #[async_trait]
    impl Negotiator for NeverNegotiates {
        async fn negotiate_upgrade(
            &self,
            _target: &Target,
            _remote_port: u16,
        ) -> Result<BoxedTransport, NegotiationError> {
            std::future::pending().await
        }
    }

    struct Refuses;

    #[async_trait]
    impl Negotiator for Refuses {
        async fn negotiate_upgrade(
            &self,
            _target: &Target,
            _remote_port: u16,
        ) -> Result<BoxedTransport, NegotiationError> {
            Err(NegotiationError::Rejected {
                status: 401,
                message: "Unauthorized".to_string(),
            })
        }
    }

    fn spec() -> ForwardSpec {
        ForwardSpec::new(Target::pod("default", "web"), 80)
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let session = TunnelSession::new(spec(), Arc::new(NeverNegotiates));
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);

        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            session.start().await,
            Err(TunnelError::NotStartable(SessionState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_failed_state() {
        let session = TunnelSession::new(spec(), Arc::new(Refuses));
        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Negotiation(NegotiationError::Rejected { status: 401, .. })
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.failure_reason().is_some());
        assert!(session.local_addr().is_none());

        tokio::time::timeout(Duration::from_secs(5), session.stop())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start_without_negotiating() {
        let mut config = ForwardConfig::default();
        config.tunnel.max_frame_size = kf_protocol::MAX_PAYLOAD_SIZE + 1;
        let session = TunnelSession::with_config(spec(), Arc::new(NeverNegotiates), &config);

        let err = tokio::time::timeout(Duration::from_secs(5), session.start())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.local_addr().is_none());

        let session = TunnelSession::builder(spec(), Arc::new(NeverNegotiates))
            .backoff(BackoffConfig {
                multiplier: f64::INFINITY,
                ..BackoffConfig::default()
            })
            .build();
        assert!(matches!(session.start().await, Err(TunnelError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_start() {
        let session = Arc::new(TunnelSession::new(spec(), Arc::new(NeverNegotiates)));

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };
        while session.state() != SessionState::Starting {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), session.stop())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            starter.await.unwrap(),
            Err(TunnelError::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_run_forever_surfaces_failure() {
        let session = TunnelSession::new(spec(), Arc::new(Refuses));
        assert!(matches!(
            session.run_forever().await,
            Err(TunnelError::Negotiation(_))
        ));
        // Already failed: reports the recorded reason
        assert!(matches!(
            session.run_forever().await,
            Err(TunnelError::SessionFailed(_))
        ));
    }
}
