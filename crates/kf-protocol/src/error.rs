//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding channel frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame kind
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Open frame without a usable port
    #[error("Malformed open frame on {channel}: {len} byte payload")]
    MalformedOpen { channel: crate::ChannelId, len: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
