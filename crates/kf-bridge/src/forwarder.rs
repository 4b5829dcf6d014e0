//! Blocking calls into the shared loop
//!
//! A [`CallForwarder`] wraps an async operation in a pending call, spawns
//! it on the shared loop and parks the calling thread on the call's
//! completion slot. Whatever the operation returns, error or panic, is
//! handed back to the caller unchanged.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::time::Duration;

use futures::{FutureExt, Stream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kf_core::config::BridgeConfig;
use kf_core::BridgeError;

use crate::loop_owner::{LoopHandle, LoopOwner};
use crate::stream::BlockingStream;

static NEXT_CALL: AtomicU64 = AtomicU64::new(1);

/// What the loop hands back through the completion slot
enum Completion<T, E> {
    Finished(std::thread::Result<Result<T, E>>),
    Cancelled,
}

/// One unit of work submitted across the sync/async boundary
///
/// Created by [`CallForwarder::call`], consumed exactly once by the loop,
/// and its completion is observed exactly once by `wait`.
struct PendingCall<T, E> {
    id: u64,
    cancel: CancellationToken,
    slot: std_mpsc::Receiver<Completion<T, E>>,
    task: JoinHandle<()>,
}

impl<T, E> PendingCall<T, E>
where
    E: From<BridgeError>,
{
    fn wait(self, timeout: Option<Duration>, cancel_grace: Duration) -> Result<T, E> {
        let completion = match timeout {
            None => self
                .slot
                .recv()
                .map_err(|_| BridgeError::LoopShutdown { call: self.id })?,
            Some(after) => match self.slot.recv_timeout(after) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::LoopShutdown { call: self.id }.into())
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(self.cancel_after_timeout(after, cancel_grace).into())
                }
            },
        };

        match completion {
            Completion::Finished(Ok(result)) => result,
            Completion::Finished(Err(panic)) => std::panic::resume_unwind(panic),
            // Only sent after the token fires, which only this type does
            Completion::Cancelled => Err(BridgeError::LoopShutdown { call: self.id }.into()),
        }
    }

    fn cancel_after_timeout(self, after: Duration, grace: Duration) -> BridgeError {
        tracing::debug!(call = self.id, ?after, "Call timed out, requesting cancellation");
        self.cancel.cancel();

        match self.slot.recv_timeout(grace) {
            // Either it unwound or it finished in the meantime; the deadline was missed regardless
            Ok(_) | Err(RecvTimeoutError::Disconnected) => BridgeError::Timeout {
                call: self.id,
                after,
            },
            Err(RecvTimeoutError::Timeout) => {
                self.task.abort();
                tracing::error!(
                    call = self.id,
                    ?grace,
                    "Operation ignored cancellation; aborting its task, resources it holds may leak"
                );
                BridgeError::ForwarderStuck {
                    call: self.id,
                    grace,
                }
            }
        }
    }
}

/// Runs async operations on the shared loop for blocking callers
#[derive(Debug, Clone)]
pub struct CallForwarder {
    handle: LoopHandle,
    cancel_grace: Duration,
}

impl CallForwarder {
    /// Forwarder on the shared loop with default settings
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_config(&BridgeConfig::default())
    }

    /// Forwarder on the shared loop
    pub fn with_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            handle: LoopOwner::acquire_with(config)?,
            cancel_grace: config.cancel_grace,
        })
    }

    /// The loop this forwarder submits to
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Run `operation` on the shared loop and block until it completes
    ///
    /// Works whether or not the calling thread is itself inside a running
    /// runtime; the operation always runs on the shared loop thread. With
    /// a `timeout`, the operation is cancelled when the deadline passes and
    /// the call fails with `BridgeError::Timeout`, or with
    /// `BridgeError::ForwarderStuck` if it does not unwind within the
    /// cancel grace period. A panic inside the operation resumes on the
    /// calling thread.
    pub fn call<F, T, E>(&self, operation: F, timeout: Option<Duration>) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<BridgeError> + Send + 'static,
    {
        if self.handle.is_loop_thread() {
            return Err(BridgeError::Reentrant.into());
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            tracing::trace!("Blocking call from inside a running runtime, forwarding to shared loop");
        }

        self.submit(operation).wait(timeout, self.cancel_grace)
    }

    /// Consume `stream` from blocking code, one forwarded call per item
    ///
    /// `item_timeout` bounds each `next()` separately.
    pub fn iter<S>(&self, stream: S, item_timeout: Option<Duration>) -> BlockingStream<S>
    where
        S: Stream + Unpin + Send + 'static,
    {
        BlockingStream::new(self.clone(), stream, item_timeout)
    }

    fn submit<F, T, E>(&self, operation: F) -> PendingCall<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let id = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, slot) = std_mpsc::sync_channel(1);

        let token = cancel.clone();
        let guard = self.handle.track_call();
        let task = self.handle.runtime().spawn(async move {
            let _guard = guard;
            let completion = tokio::select! {
                biased;
                _ = token.cancelled() => Completion::Cancelled,
                result = AssertUnwindSafe(operation).catch_unwind() => Completion::Finished(result),
            };
            let _ = tx.send(completion);
        });

        PendingCall {
            id,
            cancel,
            slot,
            task,
        }
    }
}

/// Run `operation` to completion from blocking code
///
/// Shorthand for [`CallForwarder::new`] followed by [`CallForwarder::call`].
pub fn run_blocking<F, T, E>(operation: F, timeout: Option<Duration>) -> Result<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<BridgeError> + Send + 'static,
{
    CallForwarder::new()?.call(operation, timeout)
}
