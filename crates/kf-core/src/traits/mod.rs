//! Collaborator traits

mod diagnostics;
mod negotiator;
mod resolver;

pub use diagnostics::{CloseReason, DiagnosticsSink, TracingDiagnostics};
pub use negotiator::{BoxedTransport, Negotiator, RawTransport};
pub use resolver::TargetResolver;
