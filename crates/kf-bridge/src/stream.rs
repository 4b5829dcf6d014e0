//! Blocking iteration over async streams
//!
//! Each `next()` forwards one poll of the stream to the shared loop as an
//! ordinary call, so per-item deadlines, panics and error types behave
//! exactly as they do for [`CallForwarder::call`].

use std::time::Duration;

use futures::{Stream, StreamExt};

use kf_core::BridgeError;

use crate::forwarder::CallForwarder;

/// A stream driven on the shared loop, consumed as an [`Iterator`]
///
/// Yields the stream's items in order and ends when the stream does.
/// A per-item timeout cancels the stream: the timeout error is yielded
/// and iteration ends. Items that are themselves errors do not end
/// iteration. Dropping the iterator drops the stream on the loop thread.
pub struct BlockingStream<S: Send + 'static> {
    forwarder: CallForwarder,
    stream: Option<S>,
    item_timeout: Option<Duration>,
}

impl<S: Send + 'static> BlockingStream<S> {
    pub(crate) fn new(forwarder: CallForwarder, stream: S, item_timeout: Option<Duration>) -> Self {
        Self {
            forwarder,
            stream: Some(stream),
            item_timeout,
        }
    }

    /// Whether the stream ended or was cancelled
    pub fn is_finished(&self) -> bool {
        self.stream.is_none()
    }

    fn discard(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.forwarder.loop_handle().runtime().spawn(async move {
                drop(stream);
            });
        }
    }
}

impl<S, T, E> Iterator for BlockingStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin + Send + 'static,
    T: Send + 'static,
    E: From<BridgeError> + Send + 'static,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut stream = self.stream.take()?;

        // The stream travels with the call and comes back with the item
        let polled = self.forwarder.call(
            async move {
                let item = stream.next().await;
                Ok::<_, E>((stream, item))
            },
            self.item_timeout,
        );

        match polled {
            Ok((stream, Some(item))) => {
                self.stream = Some(stream);
                Some(item)
            }
            Ok((stream, None)) => {
                self.stream = Some(stream);
                self.discard();
                None
            }
            // Timed out or the loop went away; the stream was dropped with the call
            Err(e) => Some(Err(e)),
        }
    }
}

impl<S: Send + 'static> Drop for BlockingStream<S> {
    fn drop(&mut self) {
        self.discard();
    }
}

impl<S: Send + 'static> std::fmt::Debug for BlockingStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingStream")
            .field("finished", &self.is_finished())
            .field("item_timeout", &self.item_timeout)
            .finish()
    }
}

/// Iterate `stream` from blocking code on the shared loop
///
/// Shorthand for [`CallForwarder::new`] followed by [`CallForwarder::iter`].
pub fn iter_blocking<S, T, E>(
    stream: S,
    item_timeout: Option<Duration>,
) -> Result<BlockingStream<S>, BridgeError>
where
    S: Stream<Item = Result<T, E>> + Unpin + Send + 'static,
{
    Ok(CallForwarder::new()?.iter(stream, item_timeout))
}
