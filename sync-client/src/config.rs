//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so any subset may be given.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{BackoffPolicy, DEFAULT_CHUNK_SIZE};

/// Root configuration of the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll scheduler settings.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Device handler settings.
    #[serde(default)]
    pub handler: HandlerConfig,
    /// Chunked pull settings.
    #[serde(default)]
    pub pull: PullConfig,
}

/// Poll scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between polls of a healthy link (default: 60000).
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// Base of the exponential failure delay (default: 500).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap on the backoff exponent (default: 10).
    #[serde(default = "default_max_power")]
    pub max_power: u32,
    /// Granularity of the wait loop (default: 1000).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Device handler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// How long an address lookup waits for a resolve (default: 1000).
    #[serde(default = "default_address_wait_ms")]
    pub address_wait_ms: u64,
    /// How long exit notification may take (default: 2000).
    #[serde(default = "default_exit_notify_timeout_ms")]
    pub exit_notify_timeout_ms: u64,
}

/// Chunked pull settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullConfig {
    /// Chunk size in bytes (default: 1 MiB). Must match the serving peer.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Concurrent chunk requests per transfer (default: 10).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Number of stripes of the per-paste lock (default: 16).
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
}

// Default value functions
fn default_base_interval_ms() -> u64 {
    60_000
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_max_power() -> u32 {
    10
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_address_wait_ms() -> u64 {
    1000
}

fn default_exit_notify_timeout_ms() -> u64 {
    2000
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrency() -> usize {
    10
}

fn default_lock_stripes() -> usize {
    16
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            max_power: default_max_power(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            address_wait_ms: default_address_wait_ms(),
            exit_notify_timeout_ms: default_exit_notify_timeout_ms(),
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            lock_stripes: default_lock_stripes(),
        }
    }
}

impl PollingConfig {
    /// Backoff policy built from these settings.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_interval_ms),
            Duration::from_millis(self.retry_base_ms),
            self.max_power,
        )
    }

    /// Wait loop tick (never zero).
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl HandlerConfig {
    /// Address lookup wait.
    pub fn address_wait(&self) -> Duration {
        Duration::from_millis(self.address_wait_ms)
    }

    /// Exit notification timeout.
    pub fn exit_notify_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_notify_timeout_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
