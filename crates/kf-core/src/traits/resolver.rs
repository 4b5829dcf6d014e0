//! Target resolution

use async_trait::async_trait;

use crate::error::NegotiationError;
use crate::types::Target;

/// Narrows a target to the pod one negotiation attempt should reach
///
/// Consulted before every attempt, so a retry can land on a different
/// pod than the attempt that failed. Pod targets normally resolve to
/// themselves.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<Target, NegotiationError>;
}
