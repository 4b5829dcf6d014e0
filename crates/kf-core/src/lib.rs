//! kf-core: Core abstractions and configuration for kube-forward
//!
//! This crate provides the error taxonomy, configuration structures,
//! domain types and collaborator traits shared by the bridge, the
//! tunnel and the HTTP client crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{BridgeError, ConfigError, NegotiationError, TunnelError};
pub use types::{ConnectionId, ForwardSpec, Target};
