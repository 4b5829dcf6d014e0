//! kf-protocol: Channel framing for kube-forward
//!
//! This crate defines the binary framing used to carry many logical
//! port-forward channels over a single upgraded connection.

pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;

pub use channel::{ChannelId, ChannelKind, MAX_CHANNEL_PAIRS};
pub use codec::{ChannelCodec, Frame};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Protocol token sent in the `Upgrade` header when negotiating a transport
pub const UPGRADE_PROTOCOL: &str = "kf-channels.v1";
