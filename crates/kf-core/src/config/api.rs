//! API server connection settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// How to reach the control plane that performs the upgrade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the API server
    pub server: String,

    /// Default namespace for targets
    pub namespace: String,

    /// Bearer token (takes precedence over `token_file`)
    pub token: Option<String>,

    /// File holding a bearer token
    pub token_file: Option<PathBuf>,

    /// Skip TLS certificate verification
    pub insecure_skip_tls_verify: bool,

    /// TCP connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server: "https://127.0.0.1:6443".to_string(),
            namespace: "default".to_string(),
            token: None,
            token_file: None,
            insecure_skip_tls_verify: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ApiConfig {
    /// Resolve the bearer token, reading `token_file` when needed
    pub fn bearer_token(&self) -> std::io::Result<Option<String>> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        match &self.token_file {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?.trim().to_string())),
            None => Ok(None),
        }
    }
}
