//! Accept loop and per-connection spawning

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use kf_core::{ConnectionId, TunnelError};

use super::SessionInner;
use crate::connection::{run_connection, ConnectionHandle};
use crate::mux::ChannelMultiplexer;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Accept connections on `listener` until the session stops accepting
pub(super) async fn accept_loop(
    inner: Arc<SessionInner>,
    listener: TcpListener,
    mux: Arc<ChannelMultiplexer>,
) {
    let local = listener.local_addr().ok();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = inner.accepting.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => handle_accepted(&inner, &mux, socket, peer).await,
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }

    tracing::debug!(?local, "Accept loop stopped");
}

async fn handle_accepted(
    inner: &Arc<SessionInner>,
    mux: &Arc<ChannelMultiplexer>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let id = ConnectionId::new(inner.next_connection.fetch_add(1, Ordering::Relaxed));

    let pair = match mux.open_channel_pair(id).await {
        Ok(pair) => pair,
        Err(TunnelError::ChannelExhausted { limit }) => {
            // Dropping the socket refuses the peer
            drop(socket);
            tracing::error!(
                connection = %id,
                %peer,
                limit,
                "Channel ids exhausted, refusing connection and failing session"
            );
            inner.accepting.cancel();
            inner.fail(TunnelError::ChannelExhausted { limit }.to_string());
            return;
        }
        Err(e) => {
            tracing::warn!(connection = %id, %peer, "Could not open channels: {}", e);
            return;
        }
    };

    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!(connection = %id, "Failed to set TCP_NODELAY: {}", e);
    }

    let conn = Arc::new(ConnectionHandle::new(id, peer, inner.work.child_token()));
    inner.connections.insert(id, Arc::clone(&conn));

    let session = Arc::clone(inner);
    let mux = Arc::clone(mux);
    inner.tasks.spawn(async move {
        run_connection(
            &conn,
            socket,
            pair,
            &mux,
            session.diagnostics.as_ref(),
            session.config.max_frame_size,
        )
        .await;
        session.connections.remove(&conn.id);
    });
}
