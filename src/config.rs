//! Runtime configuration (`treesync.toml`).
//!
//! Every key is optional; CLI flags override values loaded from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Default recency window in seconds.
pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 60;

/// Default per-operation read/write deadline in seconds.
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 120;

/// Default connect deadline in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Session configuration shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A timestamp difference only triggers a transfer when the newer side's
    /// timestamp is at most this many seconds old.
    pub recency_window_secs: u64,

    /// Deadline for every read-exactly operation on the connection.
    pub read_timeout_secs: u64,

    /// Deadline for every write and flush on the connection.
    pub write_timeout_secs: u64,

    /// Deadline for establishing the initiator's connection.
    pub connect_timeout_secs: u64,

    /// Responder working root; peer trees live in `{username}-{directory}` under it.
    pub root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            read_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    /// Load config from a TOML file.
    ///
    /// # Errors
    /// Returns `SyncError::Config` if the file cannot be read, parsed, or
    /// carries an invalid value.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave the connection unbounded.
    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_secs == 0 {
            return Err(SyncError::Config(
                "read_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout_secs == 0 {
            return Err(SyncError::Config(
                "write_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(SyncError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if u32::try_from(self.recency_window_secs).is_err() {
            return Err(SyncError::Config(format!(
                "recency_window_secs {} exceeds the u32 timestamp range",
                self.recency_window_secs
            )));
        }
        Ok(())
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
