//! Transport negotiation

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NegotiationError;
use crate::types::Target;

/// A raw duplex byte stream obtained from a protocol upgrade
pub trait RawTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased upgraded transport
pub type BoxedTransport = Box<dyn RawTransport>;

/// Performs authentication and protocol upgrade for a forward target
///
/// The multiplexer treats the returned transport as a black box; all it
/// needs is an ordered, reliable byte stream in both directions.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Open one upgraded connection carrying `remote_port` of `target`
    async fn negotiate_upgrade(
        &self,
        target: &Target,
        remote_port: u16,
    ) -> Result<BoxedTransport, NegotiationError>;
}
