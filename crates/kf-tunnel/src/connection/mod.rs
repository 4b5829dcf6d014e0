//! Forwarded connections
//!
//! A connection is one accepted local socket paired with one channel pair.
//! Its counters and state are written only by its own pump and read by
//! anyone through [`ConnectionInfo`] snapshots.

mod pump;

pub(crate) use pump::run_connection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use kf_core::types::ConnectionState;
use kf_core::ConnectionId;

/// Read-only snapshot of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub state: ConnectionState,
    /// Bytes read from the local socket and sent to the remote
    pub bytes_to_remote: u64,
    /// Bytes received from the remote and written to the local socket
    pub bytes_to_local: u64,
}

/// Live bookkeeping for one connection
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub opened_at: Instant,
    pub cancel: CancellationToken,
    bytes_to_remote: AtomicU64,
    bytes_to_local: AtomicU64,
    state: AtomicU8,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer,
            opened_at: Instant::now(),
            cancel,
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_local: AtomicU64::new(0),
            state: AtomicU8::new(encode(ConnectionState::Open)),
        }
    }

    pub fn add_to_remote(&self, n: usize) {
        self.bytes_to_remote.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_to_local(&self, n: usize) {
        self.bytes_to_local.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// The local peer finished sending
    pub fn local_finished(&self) {
        self.advance(ConnectionState::LocalClosed);
    }

    /// The remote finished sending
    pub fn remote_finished(&self) {
        self.advance(ConnectionState::RemoteClosed);
    }

    pub fn mark_closed(&self) {
        self.state
            .store(encode(ConnectionState::Closed), Ordering::Release);
    }

    fn advance(&self, half: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let next = match (decode(raw), half) {
                    (ConnectionState::Open, half) => half,
                    (ConnectionState::LocalClosed, ConnectionState::RemoteClosed)
                    | (ConnectionState::RemoteClosed, ConnectionState::LocalClosed) => {
                        ConnectionState::Closed
                    }
                    _ => return None,
                };
                Some(encode(next))
            });
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
        }
    }
}

fn encode(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Open => 0,
        ConnectionState::LocalClosed => 1,
        ConnectionState::RemoteClosed => 2,
        ConnectionState::Closed => 3,
    }
}

fn decode(raw: u8) -> ConnectionState {
    match raw {
        0 => ConnectionState::Open,
        1 => ConnectionState::LocalClosed,
        2 => ConnectionState::RemoteClosed,
        _ => ConnectionState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionId::new(1),
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_half_closes_combine() {
        let conn = handle();
        conn.local_finished();
        assert_eq!(conn.state(), ConnectionState::LocalClosed);
        conn.local_finished();
        assert_eq!(conn.state(), ConnectionState::LocalClosed);
        conn.remote_finished();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_closed_is_terminal() {
        let conn = handle();
        conn.mark_closed();
        conn.remote_finished();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_info_snapshot() {
        let conn = handle();
        conn.add_to_remote(10);
        conn.add_to_local(4);
        conn.add_to_local(4);

        let info = conn.info();
        assert_eq!(info.bytes_to_remote, 10);
        assert_eq!(info.bytes_to_local, 8);
        assert_eq!(info.state, ConnectionState::Open);
    }
}
