//! Transfer and thread configuration.
//!
//! Durations are stored as integer milliseconds or microseconds so the TOML
//! form stays flat and readable.

use crate::chunk::ProtocolVersion;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Defaults applied to each transfer
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Transfer thread settings
    #[serde(default)]
    pub thread: ThreadConfig,
}

/// Per-transfer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Time to wait for a chunk from the peer
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Time to wait for the first response to a start
    #[serde(default = "default_initial_chunk_timeout_ms")]
    pub initial_chunk_timeout_ms: u64,
    /// Consecutive retries before the transfer fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retries over the lifetime of the transfer
    #[serde(default = "default_max_lifetime_retries")]
    pub max_lifetime_retries: u32,
    /// Largest window a receiver advertises
    #[serde(default = "default_max_window_size_bytes")]
    pub max_window_size_bytes: u32,
    /// Largest data payload per chunk
    #[serde(default = "default_max_chunk_size_bytes")]
    pub max_chunk_size_bytes: u32,
    /// Extend the window once this fraction of it remains
    #[serde(default = "default_extend_window_divisor")]
    pub extend_window_divisor: u32,
    /// Protocol version to request
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Minimum delay between data chunks
    #[serde(default = "default_min_chunk_delay_us")]
    pub min_chunk_delay_us: u32,
}

/// Transfer thread configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Concurrent client transfers
    #[serde(default = "default_capacity")]
    pub client_capacity: usize,
    /// Concurrent server transfers
    #[serde(default = "default_capacity")]
    pub server_capacity: usize,
    /// Longest the loop sleeps without an event or deadline
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Largest encoded chunk the channel carries
    #[serde(default = "default_mtu_bytes")]
    pub mtu_bytes: usize,
}

/// Window parameters of a receiving transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParameters {
    max_window_size_bytes: u32,
    max_chunk_size_bytes: u32,
    extend_window_divisor: u32,
}

// Default values

fn default_timeout_ms() -> u64 {
    2000
}

fn default_initial_chunk_timeout_ms() -> u64 {
    4000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_lifetime_retries() -> u32 {
    1500
}

fn default_max_window_size_bytes() -> u32 {
    16 * 1024
}

fn default_max_chunk_size_bytes() -> u32 {
    1024
}

fn default_extend_window_divisor() -> u32 {
    2
}

fn default_min_chunk_delay_us() -> u32 {
    2000
}

fn default_capacity() -> usize {
    4
}

fn default_max_poll_interval_ms() -> u64 {
    250
}

fn default_mtu_bytes() -> usize {
    1500
}

/// Smallest MTU that leaves room for a chunk header and some payload
pub const MIN_MTU_BYTES: usize = 64;

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            initial_chunk_timeout_ms: default_initial_chunk_timeout_ms(),
            max_retries: default_max_retries(),
            max_lifetime_retries: default_max_lifetime_retries(),
            max_window_size_bytes: default_max_window_size_bytes(),
            max_chunk_size_bytes: default_max_chunk_size_bytes(),
            extend_window_divisor: default_extend_window_divisor(),
            protocol_version: ProtocolVersion::default(),
            min_chunk_delay_us: default_min_chunk_delay_us(),
        }
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            client_capacity: default_capacity(),
            server_capacity: default_capacity(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            mtu_bytes: default_mtu_bytes(),
        }
    }
}

impl TransferConfig {
    /// Chunk timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Timeout for the first response after starting
    #[must_use]
    pub fn initial_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_chunk_timeout_ms)
    }

    /// Minimum inter-chunk delay
    #[must_use]
    pub fn min_chunk_delay(&self) -> Duration {
        Duration::from_micros(u64::from(self.min_chunk_delay_us))
    }

    /// Window parameters derived from this config
    #[must_use]
    pub fn parameters(&self) -> TransferParameters {
        TransferParameters {
            max_window_size_bytes: self.max_window_size_bytes,
            max_chunk_size_bytes: self.max_chunk_size_bytes,
            extend_window_divisor: self.extend_window_divisor,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be non-zero"));
        }
        if self.initial_chunk_timeout_ms == 0 {
            return Err(invalid("initial_chunk_timeout_ms", "must be non-zero"));
        }
        if self.max_lifetime_retries < self.max_retries {
            return Err(invalid(
                "max_lifetime_retries",
                format!("must be at least max_retries ({})", self.max_retries),
            ));
        }
        if self.max_chunk_size_bytes == 0 {
            return Err(invalid("max_chunk_size_bytes", "must be non-zero"));
        }
        if self.max_window_size_bytes == 0 {
            return Err(invalid("max_window_size_bytes", "must be non-zero"));
        }
        if self.extend_window_divisor < 2 {
            return Err(invalid("extend_window_divisor", "must be at least 2"));
        }
        Ok(())
    }
}

impl ThreadConfig {
    /// Maximum poll interval
    #[must_use]
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_capacity == 0 {
            return Err(invalid("client_capacity", "must be non-zero"));
        }
        if self.server_capacity == 0 {
            return Err(invalid("server_capacity", "must be non-zero"));
        }
        if self.max_poll_interval_ms == 0 {
            return Err(invalid("max_poll_interval_ms", "must be non-zero"));
        }
        if self.mtu_bytes < MIN_MTU_BYTES {
            return Err(invalid(
                "mtu_bytes",
                format!("must be at least {MIN_MTU_BYTES}"),
            ));
        }
        Ok(())
    }
}

impl TransferParameters {
    /// Create parameters
    #[must_use]
    pub fn new(max_window_size_bytes: u32, max_chunk_size_bytes: u32, extend_window_divisor: u32) -> Self {
        Self {
            max_window_size_bytes,
            max_chunk_size_bytes,
            extend_window_divisor,
        }
    }

    /// Largest window in bytes
    #[must_use]
    pub fn max_window_size_bytes(&self) -> u32 {
        self.max_window_size_bytes
    }

    /// Largest chunk in bytes
    #[must_use]
    pub fn max_chunk_size_bytes(&self) -> u32 {
        self.max_chunk_size_bytes
    }

    /// Extend divisor
    #[must_use]
    pub fn extend_window_divisor(&self) -> u32 {
        self.extend_window_divisor
    }
}

impl Default for TransferParameters {
    fn default() -> Self {
        TransferConfig::default().parameters()
    }
}

impl Config {
    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()?;
        self.thread.validate()
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.protocol_version, ProtocolVersion::V2);
        assert_eq!(config.transfer.timeout(), Duration::from_secs(2));
        assert_eq!(config.thread.client_capacity, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.transfer.extend_window_divisor = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "extend_window_divisor", .. })
        ));

        config.transfer.extend_window_divisor = 2;
        config.thread.mtu_bytes = 16;
        assert!(config.validate().is_err());

        config.thread.mtu_bytes = 512;
        config.transfer.max_lifetime_retries = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            "[transfer]\nprotocol_version = \"legacy\"\nmax_chunk_size_bytes = 64\n",
        )
        .unwrap();
        assert_eq!(config.transfer.protocol_version, ProtocolVersion::Legacy);
        assert_eq!(config.transfer.max_chunk_size_bytes, 64);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.thread, ThreadConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/skiff.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
