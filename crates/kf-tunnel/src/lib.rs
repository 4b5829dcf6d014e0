//! kf-tunnel: Port-forward tunnel for kube-forward
//!
//! Exposes a local TCP port and relays every accepted connection over one
//! upgraded, multiplexed connection to a port inside the remote workload.
//!
//! [`TunnelSession`] is the cooperative API for callers already running
//! on a tokio runtime; [`forward`] and [`BlockingTunnel`] wrap it for
//! blocking callers by way of the shared loop in `kf-bridge`.

pub mod blocking;
pub mod connection;
pub mod listener;
pub mod mux;
pub mod session;

pub use blocking::{forward, forward_with_config, BlockingTunnel};
pub use connection::ConnectionInfo;
pub use listener::LocalListener;
pub use mux::{ChannelMultiplexer, ChannelPair, ChannelReader, ChannelState, ChannelWriter};
pub use session::{SessionBuilder, TunnelSession};
