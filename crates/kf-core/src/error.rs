//! Core error types for kube-forward

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use kf_protocol::ProtocolError;
use thiserror::Error;

use crate::types::{ConnectionId, SessionState};

/// Failures of the sync/async bridge itself
///
/// Errors raised by a forwarded operation are never wrapped in this type;
/// they reach the blocking caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The shared loop thread did not report ready in time
    #[error("Shared loop failed to start within {waited:?}: {reason}")]
    Startup { waited: Duration, reason: String },

    /// A bounded call exceeded its deadline and was cancelled
    #[error("Call {call} timed out after {after:?}")]
    Timeout { call: u64, after: Duration },

    /// Cancellation was requested but the operation did not unwind in time
    #[error("Call {call} ignored cancellation for {grace:?}; its task may be leaked")]
    ForwarderStuck { call: u64, grace: Duration },

    /// The shared loop went away while a call was pending
    #[error("Shared loop shut down before call {call} completed")]
    LoopShutdown { call: u64 },

    /// A blocking call was made from the shared loop thread itself
    #[error("Blocking call issued from the shared loop thread would deadlock")]
    Reentrant,
}

/// Failures while negotiating the upgraded transport
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The remote refused the request outright (authentication, authorization)
    #[error("Upgrade rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The handshake did not complete (wrong status, no upgrade, bad target)
    #[error("Upgrade handshake failed: {0}")]
    Handshake(String),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// The target could not be narrowed down to a pod (yet)
    #[error("Could not resolve target: {0}")]
    Resolve(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NegotiationError::Rejected { .. })
    }
}

/// Port-forward tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Every channel id of the transport is in use
    #[error("Channel ids exhausted: {limit} pairs already open")]
    ChannelExhausted { limit: usize },

    /// The remote error channel reported a problem for one connection
    #[error("Remote forward error on {connection}: {message}")]
    RemoteForward {
        connection: ConnectionId,
        message: String,
    },

    /// The local peer stopped reading and the connection's inbound
    /// queue filled up
    #[error("Inbound backlog of {limit} frames exceeded on {connection}")]
    InboundBacklog {
        connection: ConnectionId,
        limit: usize,
    },

    /// Operation attempted after the tunnel was closed
    #[error("Tunnel closed")]
    TunnelClosed,

    /// Local socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Upgraded transport could not be negotiated
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// `start()` called in a state it cannot leave
    #[error("Session cannot be started from state {0}")]
    NotStartable(SessionState),

    /// The session failed after it was running
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Framing error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sync/async bridge error
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Settings rejected before anything was started
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
