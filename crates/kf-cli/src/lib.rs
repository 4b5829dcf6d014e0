//! kf-cli: Command-line front end for kube-forward
//!
//! Argument parsing and configuration resolution live here so they can be
//! tested without spawning the binary.

pub mod args;

pub use args::{parse_target, Cli};
