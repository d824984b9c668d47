//! # Prefetch Host Configuration
//!
//! Configuration for the media prefetch pipeline and the host loop driving it.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [prefetch]
//! buffer_size = 8192
//! command_buffer_size = 96
//! ready_threshold_percent = 90
//! low_watermark_percent = 50
//! partial_suffix = ".part"
//!
//! [host]
//! poll_interval_ms = 10
//! log_level = "info"
//! ```
//!
//! Every field is optional; missing ones take the defaults shown above.

// src/config.rs - Single configuration file
use crate::media_prefetch::record::max_flush_size;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub host: HostConfig,
}

/// Ring buffer and line assembly limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrefetchConfig {
    /// Ring buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Longest line (including terminator) kept whole; longer lines are cropped
    #[serde(default = "default_command_buffer_size")]
    pub command_buffer_size: usize,
    #[serde(default = "default_ready_threshold_percent")]
    pub ready_threshold_percent: u8,
    #[serde(default = "default_low_watermark_percent")]
    pub low_watermark_percent: u8,
    /// Marker suffix of files still being downloaded
    #[serde(default = "default_partial_suffix")]
    pub partial_suffix: String,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            command_buffer_size: default_command_buffer_size(),
            ready_threshold_percent: default_ready_threshold_percent(),
            low_watermark_percent: default_low_watermark_percent(),
            partial_suffix: default_partial_suffix(),
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Gcode length is stored in one byte
        if !(2..=256).contains(&self.command_buffer_size) {
            return Err(ConfigError::Invalid(format!(
                "command_buffer_size must be between 2 and 256, got {}",
                self.command_buffer_size
            )));
        }
        let largest_flush = max_flush_size(self.command_buffer_size - 1);
        if self.buffer_size <= largest_flush {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} cannot hold one full command ({} bytes)",
                self.buffer_size, largest_flush
            )));
        }
        if self.ready_threshold_percent > 100 || self.low_watermark_percent > 100 {
            return Err(ConfigError::Invalid("percentages must be within 0..=100".to_string()));
        }
        Ok(())
    }
}

/// Settings of the `prefetch-host` binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_buffer_size() -> usize { 8192 }
fn default_command_buffer_size() -> usize { 96 }
fn default_ready_threshold_percent() -> u8 { 90 }
fn default_low_watermark_percent() -> u8 { 50 }
fn default_partial_suffix() -> String { ".part".to_string() }
fn default_poll_interval_ms() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.prefetch.validate()?;
    Ok(config)
}
