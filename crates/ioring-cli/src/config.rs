//! Configuration file for the ioring CLI.

use ioring::RingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Ring parameters
    #[serde(default)]
    pub ring: RingConfig,
    /// Pipelined transfer parameters
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pipelined transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes moved by each read or write request
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Requests kept outstanding at once
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Flush the destination before closing it
    #[serde(default = "default_true")]
    pub flush: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_block_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_queue_depth() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            queue_depth: default_queue_depth(),
            flush: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[allow(dead_code)]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.ring.validate()?;

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        // A single request may not exceed the kernel's per-call transfer limit
        if self.transfer.block_size == 0 || self.transfer.block_size > 64 * 1024 * 1024 {
            anyhow::bail!("Block size must be between 1 byte and 64MB");
        }

        // Every outstanding request needs a completion slot
        if self.transfer.queue_depth == 0
            || self.transfer.queue_depth > self.ring.completion_queue_size as usize
        {
            anyhow::bail!(
                "Queue depth must be between 1 and the completion queue size ({})",
                self.ring.completion_queue_size
            );
        }

        Ok(())
    }
}
