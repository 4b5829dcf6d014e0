//! kf-bridge: Blocking access to the async core
//!
//! Every network operation in kube-forward is async. This crate lets
//! ordinary blocking code call them without owning a runtime, including
//! from threads that are already inside someone else's runtime.
//!
//! All forwarded work runs on one process-wide loop thread owned by
//! [`LoopOwner`]. Blocking callers park on a completion slot; they never
//! run scheduler code themselves, so a caller sitting inside its own
//! event loop cannot deadlock by submitting to the loop it is blocking.
//! Async streams are consumed the same way through [`BlockingStream`].

pub mod forwarder;
pub mod loop_owner;
pub mod stream;

pub use forwarder::{run_blocking, CallForwarder};
pub use loop_owner::{LoopHandle, LoopOwner};
pub use stream::{iter_blocking, BlockingStream};
