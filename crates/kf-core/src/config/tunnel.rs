//! Bridge, tunnel and retry configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use kf_protocol::{MAX_CHANNEL_PAIRS, MAX_PAYLOAD_SIZE};

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Settings for the shared loop and the call forwarder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long `acquire()` waits for the loop thread to report ready
    #[serde(with = "duration_millis")]
    pub startup_grace: Duration,

    /// How long a timed-out call may take to honor cancellation
    #[serde(with = "duration_millis")]
    pub cancel_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// Multiplexer and listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Largest payload put into one data frame
    pub max_frame_size: usize,

    /// Channel pairs available per transport (at most 128)
    pub max_channel_pairs: usize,

    /// Inbound frames buffered per channel; a connection whose queue
    /// overflows is failed instead of stalling its siblings
    pub inbound_queue: usize,

    /// Outbound frames buffered before writers wait
    pub outbound_queue: usize,

    /// Upper bound on connection teardown during `stop()`
    #[serde(with = "duration_millis")]
    pub stop_grace: Duration,

    /// Addresses bound when a spec does not name any
    pub bind_addresses: Vec<IpAddr>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 32 * 1024,
            max_channel_pairs: MAX_CHANNEL_PAIRS,
            inbound_queue: 64,
            outbound_queue: 64,
            stop_grace: Duration::from_secs(5),
            bind_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

impl TunnelConfig {
    /// Reject limits the framing cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_channel_pairs == 0 || self.max_channel_pairs > MAX_CHANNEL_PAIRS {
            return Err(ConfigError::Invalid(format!(
                "max_channel_pairs must be between 1 and {}, got {}",
                MAX_CHANNEL_PAIRS, self.max_channel_pairs
            )));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}, got {}",
                MAX_PAYLOAD_SIZE, self.max_frame_size
            )));
        }
        if self.inbound_queue == 0 || self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("queue sizes must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Exponential backoff for transport negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,

    /// Attempts before giving up (including the first)
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Reject nonsensical retry settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "multiplier must be a finite number of at least 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid(format!(
                "initial delay {:?} exceeds max delay {:?}",
                self.initial, self.max
            )));
        }
        Ok(())
    }
}
