//! Sync configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.treesync/
//!   config.yaml   (optional: every key falls back to its default)
//! ```
//!
//! # API pattern
//!
//! - `load_from(path)` / `save_to(path, …)`: explicit file; used by `--config`
//! - `load_at(home)`: `<home>/.treesync/config.yaml`; used in tests with `TempDir`
//! - `load()`: derives home from `dirs::home_dir()`, delegates to `load_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::{io_err, CoreError};
use crate::types::METADATA_DIR;

/// Retry/backoff parameters for transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

/// Tunables shared by client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A path is synchronized at most once per this many seconds.
    pub rate_limit_secs: u64,
    /// Fixed chunk size in bytes.
    pub chunk_size: u64,
    /// Seconds between full reconciliation scans.
    pub scan_interval_secs: u64,
    /// How long an unpaired rename half waits for its partner.
    pub rename_window_ms: u64,
    /// Queue poll tick.
    pub poll_interval_ms: u64,
    /// Paths transferred in parallel.
    pub concurrency: usize,
    /// Re-diff attempts after a revision conflict before requeueing.
    pub conflict_retries: u32,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scan_interval_secs: 300,
            rename_window_ms: 500,
            poll_interval_ms: 1000,
            concurrency: 4,
            conflict_retries: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.chunk_size == 0 {
            return Err(CoreError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.concurrency == 0 {
            return Err(CoreError::InvalidConfig("concurrency must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::InvalidConfig("poll_interval_ms must be > 0".into()));
        }
        if self.scan_interval_secs == 0 {
            return Err(CoreError::InvalidConfig("scan_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// `<home>/.treesync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(METADATA_DIR).join("config.yaml")
}

/// Load and validate the config at `path`; defaults if the file is absent.
///
/// Returns `CoreError::ParseConfig` (with path + line context) if malformed YAML.
pub fn load_from(path: &Path) -> Result<SyncConfig, CoreError> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: SyncConfig = serde_yaml::from_str(&contents).map_err(|e| CoreError::ParseConfig {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

/// Load `<home>/.treesync/config.yaml`.
pub fn load_at(home: &Path) -> Result<SyncConfig, CoreError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, CoreError> {
    load_at(&home()?)
}

/// Save `config` to `path` atomically.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `rename`.
pub fn save_to(path: &Path, config: &SyncConfig) -> Result<(), CoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}
