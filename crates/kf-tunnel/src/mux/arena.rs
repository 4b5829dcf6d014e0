//! Channel pair allocation
//!
//! Pair indices live in a bounded arena. Freed indices go to the back of
//! the free list, so an index is reused as late as possible and stray
//! frames for a just-closed pair are unlikely to land on its successor.

use std::collections::{HashMap, VecDeque};

use kf_core::{ConnectionId, TunnelError};
use kf_protocol::{ChannelId, ChannelKind};

/// Lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Both sides may still send
    Open,
    /// One side sent `Close`
    HalfClosed,
    /// Both sides sent `Close`, or the pair was released
    Closed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Ends {
    local_closed: bool,
    remote_closed: bool,
}

impl Ends {
    fn state(&self) -> ChannelState {
        match (self.local_closed, self.remote_closed) {
            (false, false) => ChannelState::Open,
            (true, true) => ChannelState::Closed,
            _ => ChannelState::HalfClosed,
        }
    }
}

#[derive(Debug)]
struct PairSlot {
    connection: ConnectionId,
    data: Ends,
    error: Ends,
}

impl PairSlot {
    fn ends_mut(&mut self, kind: ChannelKind) -> &mut Ends {
        match kind {
            ChannelKind::Data => &mut self.data,
            ChannelKind::Error => &mut self.error,
        }
    }
}

/// Result of releasing a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Released {
    pub index: u8,
    /// Whether we still owed the remote a `Close` on the data channel
    pub data_open_locally: bool,
}

/// Free-list arena of channel pair indices
#[derive(Debug)]
pub(crate) struct PairArena {
    slots: Vec<Option<PairSlot>>,
    free: VecDeque<u8>,
    by_connection: HashMap<ConnectionId, u8>,
}

impl PairArena {
    /// Arena holding at most `limit` pairs
    pub fn new(limit: usize) -> Self {
        let limit = limit.min(kf_protocol::MAX_CHANNEL_PAIRS);
        Self {
            slots: (0..limit).map(|_| None).collect(),
            free: (0..limit as u8).collect(),
            by_connection: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.by_connection.len()
    }

    /// Reserve a pair index for `connection`
    pub fn allocate(&mut self, connection: ConnectionId) -> Result<u8, TunnelError> {
        if let Some(&index) = self.by_connection.get(&connection) {
            return Ok(index);
        }

        let index = self.free.pop_front().ok_or(TunnelError::ChannelExhausted {
            limit: self.limit(),
        })?;

        self.slots[index as usize] = Some(PairSlot {
            connection,
            data: Ends::default(),
            error: Ends::default(),
        });
        self.by_connection.insert(connection, index);
        Ok(index)
    }

    /// Give the pair of `connection` back; `None` if it holds none
    pub fn release(&mut self, connection: ConnectionId) -> Option<Released> {
        let index = self.by_connection.remove(&connection)?;
        let slot = self.slots[index as usize].take()?;
        self.free.push_back(index);
        Some(Released {
            index,
            data_open_locally: !slot.data.local_closed,
        })
    }

    /// Record that we sent `Close` on `channel`
    pub fn mark_local_closed(&mut self, channel: ChannelId) -> Option<ChannelState> {
        let slot = self.slots.get_mut(channel.pair() as usize)?.as_mut()?;
        let ends = slot.ends_mut(channel.kind());
        ends.local_closed = true;
        Some(ends.state())
    }

    /// Record that the remote sent `Close` on `channel`
    pub fn mark_remote_closed(&mut self, channel: ChannelId) -> Option<ChannelState> {
        let slot = self.slots.get_mut(channel.pair() as usize)?.as_mut()?;
        let ends = slot.ends_mut(channel.kind());
        ends.remote_closed = true;
        Some(ends.state())
    }

    /// State of `channel`; released channels report `Closed`
    pub fn state(&self, channel: ChannelId) -> ChannelState {
        self.slots
            .get(channel.pair() as usize)
            .and_then(Option::as_ref)
            .map(|slot| match channel.kind() {
                ChannelKind::Data => slot.data.state(),
                ChannelKind::Error => slot.error.state(),
            })
            .unwrap_or(ChannelState::Closed)
    }

    /// Connection currently owning pair `index`
    #[cfg(test)]
    pub fn owner(&self, index: u8) -> Option<ConnectionId> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .map(|slot| slot.connection)
    }
}
