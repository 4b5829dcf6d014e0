//! Channel identifier type
//!
//! Channels come in pairs: pair `i` owns the data channel `2i` and the
//! error channel `2i + 1`. The id is a single byte on the wire, which
//! bounds a transport to 128 concurrent pairs.

use std::fmt;

/// Maximum number of channel pairs a single transport can carry
pub const MAX_CHANNEL_PAIRS: usize = 128;

/// Direction-less role of a channel within its pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Bidirectional payload bytes
    Data,
    /// Remote-to-local error reports
    Error,
}

/// Identifier of one logical channel on a multiplexed transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Create a channel ID from its raw wire value
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    /// Data channel of the given pair
    pub fn data(pair: u8) -> Self {
        debug_assert!((pair as usize) < MAX_CHANNEL_PAIRS);
        Self(pair << 1)
    }

    /// Error channel of the given pair
    pub fn error(pair: u8) -> Self {
        debug_assert!((pair as usize) < MAX_CHANNEL_PAIRS);
        Self((pair << 1) | 1)
    }

    /// Get the raw ID value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Pair index this channel belongs to
    pub fn pair(&self) -> u8 {
        self.0 >> 1
    }

    /// Whether this is a data or an error channel
    pub fn kind(&self) -> ChannelKind {
        if self.0 & 1 == 0 {
            ChannelKind::Data
        } else {
            ChannelKind::Error
        }
    }

    /// The other channel of the same pair
    pub fn sibling(&self) -> Self {
        Self(self.0 ^ 1)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ChannelKind::Data => write!(f, "channel-{}(data)", self.0),
            ChannelKind::Error => write!(f, "channel-{}(error)", self.0),
        }
    }
}

impl From<u8> for ChannelId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}
