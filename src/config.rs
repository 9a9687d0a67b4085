//! Cache Configuration
//!
//! Every threshold, capacity, interval and pool size the engine uses lives
//! here. Files may be YAML or JSON; any omitted field takes its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Small-file threshold (8 MiB) - objects at or below go to memory
pub const DEFAULT_SMALL_THRESHOLD: u64 = 8 * MIB;

/// Medium-file threshold (32 MiB) - objects at or below go to disk
pub const DEFAULT_MEDIUM_THRESHOLD: u64 = 32 * MIB;

/// Large-file threshold (100 MiB) - objects above are never cached
pub const DEFAULT_LARGE_THRESHOLD: u64 = 100 * MIB;

/// Top-level cache configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size thresholds used for tier selection
    pub thresholds: TierThresholds,
    /// In-process memory layer
    pub memory: MemoryConfig,
    /// On-disk mirror layer
    pub filesystem: FileSystemConfig,
    /// Remote shared layer
    pub remote: RemoteConfig,
    /// Deadlines for collaborator calls
    pub timeouts: TimeoutConfig,
    /// Preload worker pool sizes
    pub workers: WorkerConfig,
    /// Promotion and fill task queue
    pub background: BackgroundConfig,
}

/// Tier selection thresholds, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            small: DEFAULT_SMALL_THRESHOLD,
            medium: DEFAULT_MEDIUM_THRESHOLD,
            large: DEFAULT_LARGE_THRESHOLD,
        }
    }
}

/// Memory layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total resident bytes
    pub capacity_bytes: u64,
    /// Largest single object accepted
    pub max_object_bytes: u64,
    /// Entry lifetime measured from store
    pub ttl_secs: u64,
    /// Expired-entry sweep interval
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: GIB,
            max_object_bytes: DEFAULT_SMALL_THRESHOLD,
            ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl MemoryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// File system layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    /// Directory holding one file per object
    pub base_dir: PathBuf,
    /// Maximum total resident bytes
    pub max_size_bytes: u64,
    /// File lifetime measured from its modification time
    pub ttl_secs: u64,
    /// TTL sweep interval
    pub sweep_interval_secs: u64,
    /// File extension (without dot)
    pub extension: String,
    /// Reads touch mtime, extending the TTL
    pub read_extends_ttl: bool,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/storage-cache"),
            max_size_bytes: 5 * GIB,
            ttl_secs: 3600,
            sweep_interval_secs: 600,
            extension: "glb".to_string(),
            read_extends_ttl: true,
        }
    }
}

impl FileSystemConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Remote layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Namespace prefix for every key the layer writes
    pub key_prefix: String,
    /// Expiry set on stored blobs
    pub ttl_secs: u64,
    /// Upper bound of a single range read while streaming
    pub chunk_size_bytes: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            key_prefix: "obj".to_string(),
            ttl_secs: 3600,
            chunk_size_bytes: 16 * MIB,
        }
    }
}

impl RemoteConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Deadlines for calls leaving the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Origin stat and download
    pub origin_secs: u64,
    /// Every remote store command
    pub remote_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            origin_secs: 30,
            remote_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn origin(&self) -> Duration {
        Duration::from_secs(self.origin_secs)
    }

    pub fn remote(&self) -> Duration {
        Duration::from_secs(self.remote_secs)
    }
}

/// Concurrent preload workers per target layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub memory: usize,
    pub filesystem: usize,
    pub remote: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            memory: 20,
            filesystem: 10,
            remote: 5,
        }
    }
}

/// Background task queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Tasks queued or running at once; extra submissions are dropped
    pub max_pending: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self { max_pending: 64 }
    }
}

impl CacheConfig {
    /// Load from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;

        let config: CacheConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            _ => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if !(t.small <= t.medium && t.medium <= t.large) {
            return Err(Error::Config(format!(
                "thresholds must be ordered small <= medium <= large (got {} / {} / {})",
                t.small, t.medium, t.large
            )));
        }

        if t.small > self.memory.max_object_bytes {
            return Err(Error::Config(format!(
                "thresholds.small ({}) exceeds memory.max_object_bytes ({}); objects routed to memory would be rejected",
                t.small, self.memory.max_object_bytes
            )));
        }

        if self.memory.max_object_bytes > self.memory.capacity_bytes {
            return Err(Error::Config(
                "memory.max_object_bytes exceeds memory.capacity_bytes".to_string(),
            ));
        }

        if self.remote.chunk_size_bytes == 0 {
            return Err(Error::Config("remote.chunk_size_bytes must be > 0".to_string()));
        }

        if self.filesystem.extension.is_empty() || self.filesystem.extension.contains('/') {
            return Err(Error::Config(format!(
                "invalid filesystem.extension: {:?}",
                self.filesystem.extension
            )));
        }

        let w = &self.workers;
        if w.memory == 0 || w.filesystem == 0 || w.remote == 0 {
            return Err(Error::Config("worker pool sizes must be > 0".to_string()));
        }

        if self.background.max_pending == 0 {
            return Err(Error::Config("background.max_pending must be > 0".to_string()));
        }

        if self.timeouts.origin_secs == 0 || self.timeouts.remote_secs == 0 {
            return Err(Error::Config("timeouts must be > 0".to_string()));
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.thresholds.small, 8 * 1024 * 1024);
        assert_eq!(config.thresholds.medium, 32 * 1024 * 1024);
        assert_eq!(config.thresholds.large, 100 * 1024 * 1024);
        assert_eq!(config.filesystem.max_size_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.filesystem.sweep_interval(), Duration::from_secs(600));
        assert_eq!(config.remote.chunk_size_bytes, 16 * 1024 * 1024);
        assert_eq!(config.workers, WorkerConfig { memory: 20, filesystem: 10, remote: 5 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = CacheConfig::default();
        config.thresholds.medium = config.thresholds.small - 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_small_threshold_must_fit_memory_objects() {
        let mut config = CacheConfig::default();
        config.thresholds.small = 2048;
        config.memory.max_object_bytes = 1024;
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("max_object_bytes")));

        config.memory.max_object_bytes = 2048;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = CacheConfig::default();
        config.workers.remote = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "filesystem:\n  base_dir: /var/cache/models\n  read_extends_ttl: false\nworkers:\n  remote: 2\n"
        )
        .unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.filesystem.base_dir, PathBuf::from("/var/cache/models"));
        assert!(!config.filesystem.read_extends_ttl);
        assert_eq!(config.filesystem.extension, "glb");
        assert_eq!(config.workers.remote, 2);
        assert_eq!(config.workers.memory, 20);
        assert_eq!(config.thresholds, TierThresholds::default());
    }

    #[test]
    fn test_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"thresholds": {{"small": 1024, "medium": 2048, "large": 4096}}}}"#).unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.thresholds.small, 1024);
        assert_eq!(config.thresholds.large, 4096);
    }
}
