//! Replication configuration via `replicore.toml`
//!
//! On first start a default `replicore.toml` with comments is written next
//! to the node's data. To change settings, edit the file and restart.

use replicore_core::{ReplicationError, Result, DEFAULT_APPLY_ERROR_BUFFER};
use replicore_storage::CacheTable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name placed in the node data directory.
pub const CONFIG_FILE_NAME: &str = "replicore.toml";

/// Replication configuration loaded from `replicore.toml`.
///
/// # Example
///
/// ```toml
/// applier_threads = 4
/// log_replicated_changes = true
/// dump_dir = "/var/lib/replicore/dumps"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationConfig {
    /// Number of applier threads.
    #[serde(default = "default_applier_threads")]
    pub applier_threads: usize,
    /// Write applied changes to the local change log.
    #[serde(default)]
    pub log_replicated_changes: bool,
    /// Check primary key uniqueness while applying.
    #[serde(default = "default_true")]
    pub unique_key_checks: bool,
    /// Check foreign keys while applying.
    #[serde(default = "default_true")]
    pub foreign_key_checks: bool,
    /// Tolerate duplicate and missing rows while applying.
    #[serde(default)]
    pub idempotent_apply: bool,
    /// Capacity of the apply error buffer in bytes.
    #[serde(default = "default_error_buffer_size")]
    pub error_buffer_size: usize,
    /// Directory receiving dumps of write-sets that failed to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_dir: Option<PathBuf>,
    /// Row lock wait timeout in milliseconds.
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,
    /// Bucket mutexes in the page cache.
    #[serde(default = "default_cache_buckets")]
    pub cache_buckets: usize,
}

fn default_applier_threads() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_error_buffer_size() -> usize {
    DEFAULT_APPLY_ERROR_BUFFER
}

fn default_lock_wait_timeout_ms() -> u64 {
    5000
}

fn default_cache_buckets() -> usize {
    64
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            applier_threads: default_applier_threads(),
            log_replicated_changes: false,
            unique_key_checks: true,
            foreign_key_checks: true,
            idempotent_apply: false,
            error_buffer_size: default_error_buffer_size(),
            dump_dir: None,
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
            cache_buckets: default_cache_buckets(),
        }
    }
}

impl ReplicationConfig {
    /// Row lock wait timeout
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    /// Page cache partitioned into `cache_buckets` bucket mutexes
    pub fn cache_table<V>(&self) -> CacheTable<V> {
        CacheTable::with_buckets(self.cache_buckets)
    }

    /// Reject settings the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a count or size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.applier_threads == 0 {
            return Err(ReplicationError::Config(
                "applier_threads must be at least 1".to_string(),
            ));
        }
        if self.cache_buckets == 0 {
            return Err(ReplicationError::Config(
                "cache_buckets must be at least 1".to_string(),
            ));
        }
        if self.error_buffer_size == 0 {
            return Err(ReplicationError::Config(
                "error_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# replicore configuration
#
# Number of applier threads (default: 1)
applier_threads = 1

# Write applied changes to the local change log (default: false)
log_replicated_changes = false

# Constraint checks while applying replicated changes
unique_key_checks = true
foreign_key_checks = true

# Tolerate duplicate and missing rows while applying (default: false)
# Tolerated errors still trigger a dump of the write-set.
idempotent_apply = false

# Capacity of the apply error buffer in bytes (default: 2048)
error_buffer_size = 2048

# Directory for dumps of write-sets that failed to apply.
# dump_dir = "/var/lib/replicore/dumps"

# Row lock wait timeout in milliseconds (default: 5000)
lock_wait_timeout_ms = 5000

# Bucket mutexes in the page cache (default: 64)
cache_buckets = 64
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ReplicationConfig = toml::from_str(&content).map_err(|e| {
            ReplicationError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ReplicationError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Load `replicore.toml` from `dir`, creating the default first if missing.
    pub fn load_or_init(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReplicationError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            ReplicationError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
