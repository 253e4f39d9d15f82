//! Database configuration via `quarry.toml`
//!
//! On first open of a directory-backed database a default `quarry.toml`
//! is written next to the phase files. Edit it and reopen to change
//! settings. In-memory databases take a [`QuarryConfig`] directly.

use quarry_core::{QuarryError, Result};
use quarry_durability::MIN_RECOVERY_WINDOW;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "quarry.toml";

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15 * 60 * 1000;
const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 60 * 60 * 1000;
const DEFAULT_RECOVERY_WINDOW: usize = MIN_RECOVERY_WINDOW;

/// Database configuration loaded from `quarry.toml`.
///
/// # Example
///
/// ```toml
/// idle_timeout_ms = 900000
/// transaction_timeout_ms = 3600000
/// recovery_window = 2
/// sync_phase_files = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarryConfig {
    /// How long a suspended transaction may sit idle before it is rolled back.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum lifetime of a transaction.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Committed phases each store keeps for recovery, at least two.
    #[serde(default = "default_recovery_window")]
    pub recovery_window: usize,
    /// Fsync phase files on prepare and commit.
    #[serde(default = "default_sync_phase_files")]
    pub sync_phase_files: bool,
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_transaction_timeout_ms() -> u64 {
    DEFAULT_TRANSACTION_TIMEOUT_MS
}

fn default_recovery_window() -> usize {
    DEFAULT_RECOVERY_WINDOW
}

fn default_sync_phase_files() -> bool {
    true
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            sync_phase_files: true,
        }
    }
}

impl QuarryConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Quarry database configuration
#
# Milliseconds a suspended transaction may stay idle before it is
# rolled back (default: 15 minutes)
idle_timeout_ms = 900000

# Maximum lifetime of a transaction in milliseconds (default: 60 minutes)
transaction_timeout_ms = 3600000

# Committed phases each store keeps on disk for recovery (minimum 1)
recovery_window = 2

# Fsync phase files when preparing and committing
sync_phase_files = true
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuarryConfig = toml::from_str(&content).map_err(|e| {
            QuarryError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| QuarryError::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no database can run with.
    pub fn validate(&self) -> Result<()> {
        if self.recovery_window < MIN_RECOVERY_WINDOW {
            return Err(QuarryError::Config(format!(
                "recovery_window must keep at least {} phases",
                MIN_RECOVERY_WINDOW
            )));
        }
        Ok(())
    }

    /// Override the idle timeout.
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Override the transaction timeout.
    pub fn with_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = ms;
        self
    }

    /// Override the recovery window.
    pub fn with_recovery_window(mut self, window: usize) -> Self {
        self.recovery_window = window;
        self
    }

    /// Override phase file syncing.
    pub fn with_sync_phase_files(mut self, sync: bool) -> Self {
        self.sync_phase_files = sync;
        self
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Transaction timeout as a duration.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}
