//! Structured connection diagnostics

use std::fmt;
use std::net::SocketAddr;

use crate::types::ConnectionId;

/// Why a forwarded connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions finished normally
    Completed,
    /// The session was stopped
    Stopped,
    /// The remote error channel reported a problem
    RemoteError(String),
    /// A local or transport I/O error
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::RemoteError(msg) => write!(f, "remote error: {}", msg),
            CloseReason::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Sink for per-connection events
///
/// Called from inside the pump tasks, so implementations must return
/// quickly and never block on I/O.
pub trait DiagnosticsSink: Send + Sync {
    /// A local connection was accepted and paired with channels
    fn connection_opened(&self, id: ConnectionId, peer: SocketAddr);

    /// A connection ended
    fn connection_closed(&self, id: ConnectionId, reason: &CloseReason);

    /// The remote side reported an error for a connection
    fn remote_forward_error(&self, id: ConnectionId, message: &str);
}

/// Default sink that turns events into `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn connection_opened(&self, id: ConnectionId, peer: SocketAddr) {
        tracing::debug!(connection = %id, %peer, "connection_opened");
    }

    fn connection_closed(&self, id: ConnectionId, reason: &CloseReason) {
        match reason {
            CloseReason::Failed(_) => {
                tracing::warn!(connection = %id, %reason, "connection_closed")
            }
            _ => tracing::debug!(connection = %id, %reason, "connection_closed"),
        }
    }

    fn remote_forward_error(&self, id: ConnectionId, message: &str) {
        tracing::warn!(connection = %id, error = message, "remote_forward_error");
    }
}
