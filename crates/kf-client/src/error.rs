//! Client error types

use thiserror::Error;

/// Errors from plain (non-upgrade) API calls
#[derive(Error, Debug)]
pub enum ClientError {
    /// The HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    /// Bearer token file could not be read
    #[error("Failed to read bearer token: {0}")]
    Token(#[source] std::io::Error),

    /// Request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body was not the expected JSON
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}
