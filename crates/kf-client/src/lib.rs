//! kf-client: HTTP plumbing for kube-forward
//!
//! `ApiClient` is a thin authenticated wrapper over `reqwest`, and
//! `HttpUpgradeNegotiator` turns a port-forward request into the raw
//! upgraded byte stream the tunnel multiplexes channels over.
//! `ReadyPodResolver` lets a service be forwarded through one of its
//! ready pods.

pub mod api;
pub mod error;
pub mod negotiator;
pub mod resolver;

pub use api::{ApiClient, ServerVersion};
pub use error::ClientError;
pub use negotiator::HttpUpgradeNegotiator;
pub use resolver::ReadyPodResolver;
