//! Byte pumps between a local socket and a channel pair

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use kf_core::traits::{CloseReason, DiagnosticsSink};
use kf_core::{ConnectionId, TunnelError};

use super::ConnectionHandle;
use crate::mux::{ChannelMultiplexer, ChannelPair, ChannelReader, ChannelWriter};

/// Relay bytes for one connection until it finishes, fails or is cancelled
///
/// Always releases the channel pair and reports the outcome to
/// `diagnostics` before returning.
pub(crate) async fn run_connection(
    conn: &ConnectionHandle,
    socket: TcpStream,
    pair: ChannelPair,
    mux: &ChannelMultiplexer,
    diagnostics: &dyn DiagnosticsSink,
    chunk_size: usize,
) -> CloseReason {
    let backlog_error = pair.backlog_error();
    let ChannelPair {
        reader,
        writer,
        errors,
        backlog,
        ..
    } = pair;
    let (local_read, local_write) = socket.into_split();

    diagnostics.connection_opened(conn.id, conn.peer);

    let reason = tokio::select! {
        biased;
        _ = conn.cancel.cancelled() => CloseReason::Stopped,
        _ = backlog.cancelled() => CloseReason::Failed(backlog_error.to_string()),
        err = watch_errors(conn.id, errors) => {
            let message = match err {
                TunnelError::RemoteForward { message, .. } => message,
                other => other.to_string(),
            };
            diagnostics.remote_forward_error(conn.id, &message);
            CloseReason::RemoteError(message)
        }
        result = async {
            tokio::try_join!(
                local_to_remote(conn, local_read, writer, chunk_size),
                remote_to_local(conn, reader, local_write),
            )
        } => match result {
            Ok(_) => CloseReason::Completed,
            Err(TunnelError::TunnelClosed) => CloseReason::Stopped,
            Err(e) => CloseReason::Failed(e.to_string()),
        },
    };

    mux.close_channel_pair(conn.id);
    conn.mark_closed();
    diagnostics.connection_closed(conn.id, &reason);
    tracing::debug!(
        connection = %conn.id,
        %reason,
        elapsed = ?conn.opened_at.elapsed(),
        "Connection finished"
    );
    reason
}

async fn local_to_remote(
    conn: &ConnectionHandle,
    mut local: OwnedReadHalf,
    mut writer: ChannelWriter,
    chunk_size: usize,
) -> Result<(), TunnelError> {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        let n = local.read_buf(&mut buf).await?;
        if n == 0 {
            writer.close_write().await?;
            conn.local_finished();
            return Ok(());
        }

        conn.add_to_remote(n);
        writer.send(buf.split().freeze()).await?;
        tokio::task::yield_now().await;
    }
}

async fn remote_to_local(
    conn: &ConnectionHandle,
    mut reader: ChannelReader,
    mut local: OwnedWriteHalf,
) -> Result<(), TunnelError> {
    while let Some(bytes) = reader.recv().await? {
        local.write_all(&bytes).await?;
        conn.add_to_local(bytes.len());
        tokio::task::yield_now().await;
    }

    // The peer may already be gone; half-closing is best effort
    if let Err(e) = local.shutdown().await {
        tracing::debug!(connection = %conn.id, "Local shutdown failed: {}", e);
    }
    conn.remote_finished();
    Ok(())
}

/// Resolves only if the remote reports an error for this connection
async fn watch_errors(connection: ConnectionId, mut errors: ChannelReader) -> TunnelError {
    loop {
        match errors.recv().await {
            Ok(Some(bytes)) if bytes.is_empty() => continue,
            Ok(Some(bytes)) => {
                return TunnelError::RemoteForward {
                    connection,
                    message: String::from_utf8_lossy(&bytes).trim().to_string(),
                }
            }
            // A quiet error channel is the normal case
            Ok(None) | Err(_) => return std::future::pending().await,
        }
    }
}
