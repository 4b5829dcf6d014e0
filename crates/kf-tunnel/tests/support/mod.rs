//! Mock remote for tunnel tests
//!
//! `MockNegotiator` hands the tunnel one end of an in-memory duplex pipe.
//! The other end either runs an echo server or is handed to the test as a
//! framed stream speaking the real channel codec.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use kf_core::traits::{BoxedTransport, Negotiator};
use kf_core::{NegotiationError, Target};
use kf_protocol::{ChannelCodec, ChannelKind, Frame, FrameKind};

pub type RemoteEnd = Framed<DuplexStream, ChannelCodec>;

const PIPE_CAPACITY: usize = 256 * 1024;

enum Mode {
    Echo,
    Handoff(mpsc::UnboundedSender<RemoteEnd>),
    Hang,
}

pub struct MockNegotiator {
    mode: Mode,
    failures: Mutex<VecDeque<NegotiationError>>,
    attempts: AtomicUsize,
}

impl MockNegotiator {
    /// Remote echoes every data frame and acknowledges every close
    pub fn echo() -> Self {
        Self::with_mode(Mode::Echo)
    }

    /// Remote end is handed to the test through the returned receiver
    pub fn handoff() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_mode(Mode::Handoff(tx)), rx)
    }

    /// Negotiation never completes
    pub fn hang() -> Self {
        Self::with_mode(Mode::Hang)
    }

    /// Fail the first attempts with these errors before succeeding
    pub fn failing_first(self, errors: Vec<NegotiationError>) -> Self {
        *self.failures.lock().unwrap() = errors.into();
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn negotiate_upgrade(
        &self,
        _target: &Target,
        _remote_port: u16,
    ) -> Result<BoxedTransport, NegotiationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let remote = Framed::new(remote, ChannelCodec::new());
        match &self.mode {
            Mode::Echo => {
                tokio::spawn(echo(remote));
            }
            Mode::Handoff(tx) => {
                let _ = tx.send(remote);
            }
            Mode::Hang => std::future::pending::<()>().await,
        }
        Ok(Box::new(local))
    }
}

async fn echo(mut remote: RemoteEnd) {
    while let Some(Ok(frame)) = remote.next().await {
        let reply = match (frame.kind, frame.channel.kind()) {
            (FrameKind::Data, ChannelKind::Data) => Frame::data(frame.channel, frame.payload),
            (FrameKind::Close, _) => Frame::close(frame.channel),
            _ => continue,
        };
        if remote.send(reply).await.is_err() {
            return;
        }
    }
}

/// Next frame from the remote end
pub async fn next_frame(remote: &mut RemoteEnd) -> Frame {
    remote
        .next()
        .await
        .expect("transport closed")
        .expect("protocol error")
}

/// Concatenate data-frame payloads until `len` bytes arrived
pub async fn read_data(remote: &mut RemoteEnd, len: usize) -> Bytes {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let frame = next_frame(remote).await;
        if frame.kind == FrameKind::Data {
            out.extend_from_slice(&frame.payload);
        }
    }
    Bytes::from(out)
}
