//! Channel multiplexing over one upgraded transport
//!
//! One reader task demultiplexes inbound frames into bounded per-channel
//! queues without ever waiting on one: a connection whose queue is full
//! is failed on its own. One writer task drains a single outbound queue,
//! so frames from different channels are written whole and in FIFO order.

mod arena;
mod channel;

pub use arena::ChannelState;
pub use channel::{ChannelPair, ChannelReader, ChannelWriter};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use kf_core::config::TunnelConfig;
use kf_core::traits::{BoxedTransport, Negotiator};
use kf_core::{ConnectionId, Target, TunnelError};
use kf_protocol::{ChannelCodec, ChannelId, Frame, FrameKind};

use arena::PairArena;

/// How long `close()` waits for the I/O tasks before aborting them
const TASK_DRAIN: Duration = Duration::from_secs(1);

/// Inbound side of one channel
#[derive(Clone)]
struct Route {
    tx: mpsc::Sender<Bytes>,
    /// Shared by both channels of a pair, cancelled when either overflows
    backlog: CancellationToken,
    connection: ConnectionId,
}

/// State shared between the multiplexer, its tasks and its channels
pub(crate) struct MuxShared {
    routes: DashMap<ChannelId, Route>,
    arena: Mutex<PairArena>,
    closed: CancellationToken,
    transport_lost: CancellationToken,
    max_frame_size: usize,
}

impl MuxShared {
    fn arena(&self) -> MutexGuard<'_, PairArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_local_closed(&self, channel: ChannelId) {
        self.arena().mark_local_closed(channel);
    }

    /// Route one inbound frame; never waits on a channel's queue
    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Data => {
                let Some(route) = self.routes.get(&frame.channel).map(|r| r.value().clone()) else {
                    tracing::debug!(
                        channel = %frame.channel,
                        len = frame.payload.len(),
                        "Dropping frame for unknown channel"
                    );
                    return;
                };

                match route.tx.try_send(frame.payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            connection = %route.connection,
                            channel = %frame.channel,
                            capacity = route.tx.max_capacity(),
                            "Inbound backlog full, failing connection"
                        );
                        // Later frames for this pair are dropped as unknown
                        self.routes.remove(&frame.channel);
                        self.routes.remove(&frame.channel.sibling());
                        route.backlog.cancel();
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(channel = %frame.channel, "Channel reader gone, dropping frame");
                    }
                }
            }
            FrameKind::Close => {
                let state = self.arena().mark_remote_closed(frame.channel);
                // Dropping the route ends the reader after whatever it has buffered
                self.routes.remove(&frame.channel);
                tracing::debug!(channel = %frame.channel, ?state, "Remote closed channel");
            }
            FrameKind::Open => {
                tracing::debug!(channel = %frame.channel, "Ignoring inbound open frame");
            }
        }
    }
}

/// Many logical channels over one upgraded transport
pub struct ChannelMultiplexer {
    shared: Arc<MuxShared>,
    outbound: mpsc::Sender<Frame>,
    remote_port: u16,
    inbound_queue: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    /// Negotiate a transport for `remote_port` of `target` and multiplex it
    pub async fn connect(
        negotiator: &dyn Negotiator,
        target: &Target,
        remote_port: u16,
        config: &TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let transport = negotiator.negotiate_upgrade(target, remote_port).await?;
        Ok(Self::new(transport, remote_port, config))
    }

    /// Multiplex an already negotiated transport
    ///
    /// Spawns the reader and writer tasks, so this must run inside a
    /// tokio runtime.
    pub fn new(transport: BoxedTransport, remote_port: u16, config: &TunnelConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let shared = Arc::new(MuxShared {
            routes: DashMap::new(),
            arena: Mutex::new(PairArena::new(config.max_channel_pairs)),
            closed: CancellationToken::new(),
            transport_lost: CancellationToken::new(),
            max_frame_size: config.max_frame_size.max(1),
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&shared),
            FramedRead::new(read_half, ChannelCodec::new()),
        ));
        let writer = tokio::spawn(write_loop(
            Arc::clone(&shared),
            outbound_rx,
            FramedWrite::new(write_half, ChannelCodec::new()),
        ));

        tracing::debug!(remote_port, "Channel multiplexer started");

        Self {
            shared,
            outbound,
            remote_port,
            inbound_queue: config.inbound_queue.max(1),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Allocate and announce the data/error channel pair for `connection`
    pub async fn open_channel_pair(
        &self,
        connection: ConnectionId,
    ) -> Result<ChannelPair, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::TunnelClosed);
        }

        let index = self.shared.arena().allocate(connection)?;
        let data = ChannelId::data(index);
        let error = ChannelId::error(index);

        let backlog = CancellationToken::new();
        let (data_tx, data_rx) = mpsc::channel(self.inbound_queue);
        let (error_tx, error_rx) = mpsc::channel(self.inbound_queue);
        for (channel, tx) in [(data, data_tx), (error, error_tx)] {
            let route = Route {
                tx,
                backlog: backlog.clone(),
                connection,
            };
            self.shared.routes.insert(channel, route);
        }

        let announced = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => false,
            sent = self.outbound.send(Frame::open(data, self.remote_port)) => sent.is_ok(),
        };
        if !announced {
            self.close_channel_pair(connection);
            return Err(TunnelError::TunnelClosed);
        }

        tracing::debug!(%connection, %data, %error, "Opened channel pair");

        Ok(ChannelPair {
            connection,
            reader: ChannelReader::new(data, data_rx, Arc::clone(&self.shared)),
            writer: ChannelWriter::new(data, self.outbound.clone(), Arc::clone(&self.shared)),
            errors: ChannelReader::new(error, error_rx, Arc::clone(&self.shared)),
            backlog,
            inbound_queue: self.inbound_queue,
        })
    }

    /// Release the pair of `connection`; no-op if it has none
    ///
    /// Returns whether a pair was released. If we had not yet sent `Close`
    /// on the data channel, one is queued without waiting for room.
    pub fn close_channel_pair(&self, connection: ConnectionId) -> bool {
        let Some(released) = self.shared.arena().release(connection) else {
            return false;
        };

        let data = ChannelId::data(released.index);
        self.shared.routes.remove(&data);
        self.shared.routes.remove(&data.sibling());

        if released.data_open_locally && !self.is_closed() {
            if let Err(e) = self.outbound.try_send(Frame::close(data)) {
                tracing::debug!(%connection, %data, "Could not queue close frame: {}", e);
            }
        }

        tracing::debug!(%connection, %data, "Released channel pair");
        true
    }

    /// State of one channel
    pub fn channel_state(&self, channel: ChannelId) -> ChannelState {
        self.shared.arena().state(channel)
    }

    /// Channel pairs currently allocated
    pub fn open_pairs(&self) -> usize {
        self.shared.arena().in_use()
    }

    /// Whether `close()` or `force_close()` ran
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Cancelled when the transport ends without `close()` being called
    pub fn lost_signal(&self) -> CancellationToken {
        self.shared.transport_lost.clone()
    }

    /// Stop both I/O tasks and close the transport
    ///
    /// Pending and future reads on every channel fail with `TunnelClosed`.
    /// Frames already queued are flushed on a best-effort basis.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.routes.clear();

        let tasks = std::mem::take(&mut *self.tasks());
        for mut task in tasks {
            if tokio::time::timeout(TASK_DRAIN, &mut task).await.is_err() {
                tracing::warn!("Multiplexer task did not finish in {:?}, aborting", TASK_DRAIN);
                task.abort();
            }
        }
    }

    /// Synchronous teardown for contexts that cannot await
    pub fn force_close(&self) {
        self.shared.closed.cancel();
        self.shared.routes.clear();
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        self.force_close();
    }
}

async fn read_loop(shared: Arc<MuxShared>, mut frames: FramedRead<ReadHalf<BoxedTransport>, ChannelCodec>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => shared.dispatch(frame),
            Some(Err(e)) => {
                tracing::error!("Protocol error on transport: {}", e);
                break;
            }
            None => {
                tracing::debug!("Transport closed by remote");
                break;
            }
        }
    }

    // Readers see end of stream once their buffered frames are drained
    shared.routes.clear();
    if !shared.closed.is_cancelled() {
        tracing::error!("Lost upgraded transport");
        shared.transport_lost.cancel();
    }
}

async fn write_loop(
    shared: Arc<MuxShared>,
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: FramedWrite<WriteHalf<BoxedTransport>, ChannelCodec>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };

        if let Err(e) = sink.send(frame).await {
            tracing::warn!("Failed to write frame: {}", e);
            if !shared.closed.is_cancelled() {
                shared.transport_lost.cancel();
            }
            return;
        }
    }

    // Flush close frames queued during shutdown
    while let Ok(frame) = outbound.try_recv() {
        if sink.feed(frame).await.is_err() {
            return;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!("Error closing transport: {}", e);
    }
}
