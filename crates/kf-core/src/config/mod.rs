//! Configuration management for kube-forward

mod api;
mod tunnel;
pub mod serde_utils;

pub use api::ApiConfig;
pub use tunnel::{BackoffConfig, BridgeConfig, TunnelConfig};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Sync/async bridge settings
    pub bridge: BridgeConfig,
    /// Tunnel and multiplexer settings
    pub tunnel: TunnelConfig,
    /// Negotiation retry settings
    pub backoff: BackoffConfig,
    /// API server connection
    pub api: ApiConfig,
}

impl ForwardConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.backoff.validate()
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kube-forward")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ForwardConfig::default();
        config.tunnel.max_channel_pairs = 16;
        config.bridge.cancel_grace = Duration::from_millis(250);
        config.api.namespace = "staging".to_string();

        save_config(&path, &config).unwrap();
        let loaded: ForwardConfig = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tunnel]\nmax_frame_size = 4096\n").unwrap();

        let loaded: ForwardConfig = load_config(&path).unwrap();
        assert_eq!(loaded.tunnel.max_frame_size, 4096);
        assert_eq!(loaded.tunnel.max_channel_pairs, TunnelConfig::default().max_channel_pairs);
        assert_eq!(loaded.bridge, BridgeConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let result: Result<ForwardConfig, _> = load_config(Path::new("/nonexistent/kf.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
