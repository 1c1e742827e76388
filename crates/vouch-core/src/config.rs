//! Runtime configuration, loaded from TOML.
//!
//! ```toml
//! [sync]
//! auto_flush = true
//! max_reconcile_rounds = 16
//! exchange_timeout_ms = 30000
//! mirror_window = 4096
//!
//! [store]
//! retention_secs = 31536000
//! purge_interval_secs = 3600
//! data_dir = "/var/lib/vouch"
//! ```

use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One year
pub const DEFAULT_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// One hour
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60 * 60;

/// Audit times of folded-in entries a client keeps below its watermark
pub const DEFAULT_MIRROR_WINDOW: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Spawn a transmission task after every `execute`
    pub auto_flush: bool,
    /// Upper bound on recursive reconciliation rounds in one pass
    pub max_reconcile_rounds: usize,
    /// How long callers wait on an exchange; a running pass is never interrupted
    pub exchange_timeout_ms: u64,
    /// Mirror records more than this many audit times below the watermark
    /// are pruned when it advances
    pub mirror_window: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            max_reconcile_rounds: 16,
            exchange_timeout_ms: 30_000,
            mirror_window: DEFAULT_MIRROR_WINDOW,
        }
    }
}

impl SyncConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Audit entries older than this may be purged
    pub retention_secs: u64,
    /// How often a host sweeps every stream for expired entries
    pub purge_interval_secs: u64,
    /// Filesystem root; in-memory storage when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            purge_interval_secs: DEFAULT_PURGE_INTERVAL_SECS,
            data_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VouchConfig {
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

impl VouchConfig {
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: VouchConfig = toml::from_str(content)
            .map_err(|e| CoreError::config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.sync.max_reconcile_rounds == 0 {
            return Err(CoreError::config("sync.max_reconcile_rounds must be at least 1"));
        }
        if self.sync.exchange_timeout_ms == 0 {
            return Err(CoreError::config("sync.exchange_timeout_ms must be positive"));
        }
        if self.store.retention_secs == 0 {
            return Err(CoreError::config("store.retention_secs must be positive"));
        }
        if self.store.purge_interval_secs == 0 {
            return Err(CoreError::config("store.purge_interval_secs must be positive"));
        }
        Ok(())
    }
}
