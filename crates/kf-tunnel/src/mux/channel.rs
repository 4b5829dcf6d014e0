//! Per-channel endpoints handed out by the multiplexer

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kf_core::{ConnectionId, TunnelError};
use kf_protocol::{ChannelId, Frame};

use super::MuxShared;

/// The three endpoints of one connection's channel pair
pub struct ChannelPair {
    /// Connection the pair belongs to
    pub connection: ConnectionId,
    /// Inbound bytes on the data channel
    pub reader: ChannelReader,
    /// Outbound bytes on the data channel
    pub writer: ChannelWriter,
    /// Inbound bytes on the error channel
    pub errors: ChannelReader,
    /// Cancelled when inbound frames arrived faster than they were read
    pub backlog: CancellationToken,
    /// Frames each inbound queue holds
    pub inbound_queue: usize,
}

impl ChannelPair {
    /// Error describing an overflowed inbound queue
    pub fn backlog_error(&self) -> TunnelError {
        TunnelError::InboundBacklog {
            connection: self.connection,
            limit: self.inbound_queue,
        }
    }
}

/// Receiving end of one channel
pub struct ChannelReader {
    id: ChannelId,
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<MuxShared>,
}

impl ChannelReader {
    pub(super) fn new(id: ChannelId, rx: mpsc::Receiver<Bytes>, shared: Arc<MuxShared>) -> Self {
        Self { id, rx, shared }
    }

    /// Channel this reader drains
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next chunk of payload, `None` at end of stream
    ///
    /// Fails with `TunnelClosed` once the multiplexer was closed
    /// explicitly, even if frames were still buffered.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.shared.closed.is_cancelled() {
            return Err(TunnelError::TunnelClosed);
        }

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(TunnelError::TunnelClosed),
            next = self.rx.recv() => match next {
                Some(bytes) => Ok(Some(bytes)),
                None if self.shared.closed.is_cancelled() => Err(TunnelError::TunnelClosed),
                None => Ok(None),
            },
        }
    }
}

/// Sending end of a data channel
pub struct ChannelWriter {
    id: ChannelId,
    outbound: mpsc::Sender<Frame>,
    shared: Arc<MuxShared>,
    write_closed: bool,
}

impl ChannelWriter {
    pub(super) fn new(id: ChannelId, outbound: mpsc::Sender<Frame>, shared: Arc<MuxShared>) -> Self {
        Self {
            id,
            outbound,
            shared,
            write_closed: false,
        }
    }

    /// Channel this writer feeds
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue `data` for the remote, split into frames of at most
    /// `max_frame_size` bytes
    pub async fn send(&mut self, mut data: Bytes) -> Result<(), TunnelError> {
        if self.write_closed {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} already closed for writing", self.id),
            )));
        }

        while !data.is_empty() {
            let take = data.len().min(self.shared.max_frame_size);
            let chunk = data.split_to(take);
            self.enqueue(Frame::data(self.id, chunk)).await?;
        }
        Ok(())
    }

    /// Tell the remote we will send nothing more; idempotent
    pub async fn close_write(&mut self) -> Result<(), TunnelError> {
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        self.shared.mark_local_closed(self.id);
        self.enqueue(Frame::close(self.id)).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), TunnelError> {
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(TunnelError::TunnelClosed),
            sent = self.outbound.send(frame) => sent.map_err(|_| TunnelError::TunnelClosed),
        }
    }
}
