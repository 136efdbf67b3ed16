use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StrataResult;
use crate::storage::page::DEFAULT_PAGE_SIZE;
use crate::transaction::IsolationLevel;

/// Database-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub page_size: usize,
    pub lock_timeout_ms: u64,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Downgrade default/identity failures to warnings while loading a
    /// damaged file. Never on by default.
    pub repair_mode: bool,
    /// Skip the lock manager for every handle (private databases)
    pub virtual_locks: bool,
    /// Text and binary values longer than this go to their own cluster
    pub extension_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            lock_timeout_ms: 10_000,
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            repair_mode: false,
            virtual_locks: false,
            extension_threshold: 1024,
        }
    }
}

impl DatabaseConfig {
    /// Read a JSON config file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> StrataResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> StrataResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            lock_timeout: self.lock_timeout(),
            isolation: self.isolation,
        }
    }
}

/// Per-connection overrides
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionOptions {
    pub lock_timeout: Duration,
    pub isolation: IsolationLevel,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        DatabaseConfig::default().connection_options()
    }
}
