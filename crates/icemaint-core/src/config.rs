//! Configuration structures for icemaint.
//!
//! Configuration is loaded from TOML files and can be overridden per call
//! through procedure parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Upper bound for any retention or grace period, in days.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Warehouse storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Compaction planning configuration
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Catalog commit retry configuration
    #[serde(default)]
    pub commit: CommitConfig,

    /// Parallel I/O configuration
    #[serde(default)]
    pub io: IoConfig,

    /// Snapshot and orphan retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Memory guard configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Warehouse storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Local directory used as the warehouse root
    #[serde(default = "default_warehouse_path")]
    pub warehouse_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warehouse_path: default_warehouse_path(),
        }
    }
}

/// Compaction planning configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    /// Target size of rewritten files
    #[serde(default = "default_target_file_size_mb")]
    pub target_file_size_mb: u64,

    /// Maximum number of input files merged into one group
    #[serde(default = "default_max_files_per_group")]
    pub max_files_per_group: usize,

    /// Compression for rewritten Parquet files
    #[serde(default)]
    pub compression: ParquetCompression,
}

impl CompactionConfig {
    /// Target size in bytes.
    pub fn target_file_size_bytes(&self) -> u64 {
        self.target_file_size_mb * MB
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_file_size_mb: default_target_file_size_mb(),
            max_files_per_group: default_max_files_per_group(),
            compression: ParquetCompression::default(),
        }
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, good balance)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

/// Catalog commit retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitConfig {
    /// Retries after a version conflict before aborting
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Parallel I/O configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IoConfig {
    /// Concurrent file operations
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Retries per file operation for transient errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Paths handed to the delete pool per chunk while streaming a listing
    #[serde(default = "default_delete_chunk_size")]
    pub delete_chunk_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            delete_chunk_size: default_delete_chunk_size(),
        }
    }
}

/// Snapshot and orphan retention configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Snapshots younger than this are always retained
    #[serde(default = "default_max_snapshot_age_days")]
    pub max_snapshot_age_days: u32,

    /// Minimum number of most recent snapshots to keep
    #[serde(default = "default_min_snapshots_to_keep")]
    pub min_snapshots_to_keep: usize,

    /// Unreferenced files younger than this are never deleted
    #[serde(default = "default_orphan_grace_period_days")]
    pub orphan_grace_period_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_snapshot_age_days: default_max_snapshot_age_days(),
            min_snapshots_to_keep: default_min_snapshots_to_keep(),
            orphan_grace_period_days: default_orphan_grace_period_days(),
        }
    }
}

/// Memory guard configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Upper bound on decoded batch memory held by one operation (unlimited when unset)
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    /// Rows per decoded batch
    #[serde(default = "default_read_batch_rows")]
    pub read_batch_rows: usize,
}

impl MemoryConfig {
    /// Limit in bytes, if any.
    pub fn max_memory_bytes(&self) -> Option<usize> {
        self.max_memory_mb.map(|mb| (mb * MB) as usize)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            read_batch_rows: default_read_batch_rows(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_warehouse_path() -> PathBuf {
    PathBuf::from("./warehouse")
}
fn default_target_file_size_mb() -> u64 {
    128
}
fn default_max_files_per_group() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_max_workers() -> usize {
    4
}
fn default_delete_chunk_size() -> usize {
    1000
}
fn default_max_snapshot_age_days() -> u32 {
    7
}
fn default_min_snapshots_to_keep() -> usize {
    1
}
fn default_orphan_grace_period_days() -> u32 {
    3
}
fn default_read_batch_rows() -> usize {
    8192
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.compaction.target_file_size_mb == 0 {
            return Err(crate::Error::Config(
                "compaction.target_file_size_mb must be greater than zero".into(),
            ));
        }

        if self.compaction.max_files_per_group < 2 {
            return Err(crate::Error::Config(
                "compaction.max_files_per_group must be at least 2".into(),
            ));
        }

        if self.io.max_workers == 0 {
            return Err(crate::Error::Config(
                "io.max_workers must be greater than zero".into(),
            ));
        }

        if self.io.delete_chunk_size == 0 {
            return Err(crate::Error::Config(
                "io.delete_chunk_size must be greater than zero".into(),
            ));
        }

        if self.memory.read_batch_rows == 0 {
            return Err(crate::Error::Config(
                "memory.read_batch_rows must be greater than zero".into(),
            ));
        }

        for (name, days) in [
            ("max_snapshot_age_days", self.retention.max_snapshot_age_days),
            ("orphan_grace_period_days", self.retention.orphan_grace_period_days),
        ] {
            if u64::from(days) > MAX_RETENTION_DAYS {
                return Err(crate::Error::Config(format!(
                    "retention.{} must be at most {}, got {}",
                    name, MAX_RETENTION_DAYS, days
                )));
            }
        }

        if self.retention.min_snapshots_to_keep == 0 {
            tracing::warn!("min_snapshots_to_keep = 0; only the current snapshot is guaranteed");
        }

        if self.retention.orphan_grace_period_days == 0 {
            tracing::warn!(
                "orphan_grace_period_days = 0 may delete files that in-flight writers have not committed yet"
            );
        }

        Ok(())
    }

    /// Backoff settings for catalog commits.
    pub fn commit_retry(&self) -> crate::executor::RetryPolicy {
        crate::executor::RetryPolicy::new(
            self.commit.max_retries,
            Duration::from_millis(self.commit.base_delay_ms),
            Duration::from_millis(self.commit.max_delay_ms),
        )
    }

    /// Backoff settings for individual file operations.
    pub fn io_retry(&self) -> crate::executor::RetryPolicy {
        crate::executor::RetryPolicy::new(
            self.io.max_retries,
            Duration::from_millis(self.io.base_delay_ms),
            Duration::from_millis(self.io.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.compaction.target_file_size_mb, 128);
        assert_eq!(config.compaction.target_file_size_bytes(), 128 * MB);
        assert_eq!(config.compaction.max_files_per_group, 100);
        assert_eq!(config.commit.max_retries, 3);
        assert_eq!(config.io.max_workers, 4);
        assert_eq!(config.retention.max_snapshot_age_days, 7);
        assert_eq!(config.retention.min_snapshots_to_keep, 1);
        assert_eq!(config.retention.orphan_grace_period_days, 3);
        assert!(config.memory.max_memory_bytes().is_none());
        assert_eq!(config.monitoring.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [compaction]
            target_file_size_mb = 64
            max_files_per_group = 6

            [memory]
            max_memory_mb = 512

            [monitoring]
            log_format = "text"
            "#,
        )
        .unwrap();

        assert_eq!(config.compaction.target_file_size_bytes(), 64 * MB);
        assert_eq!(config.compaction.max_files_per_group, 6);
        assert_eq!(config.compaction.compression, ParquetCompression::Snappy);
        assert_eq!(config.memory.max_memory_bytes(), Some(512 * MB as usize));
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        assert_eq!(config.io.max_retries, 3);
    }

    #[test]
    fn test_validation_rejects_zero_target() {
        let mut config = Config::default();
        config.compaction.target_file_size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.io.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_retention_days() {
        let mut config = Config::default();
        config.retention.orphan_grace_period_days = u32::MAX;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = Config::default();
        config.retention.max_snapshot_age_days = MAX_RETENTION_DAYS as u32 + 1;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.retention.max_snapshot_age_days = MAX_RETENTION_DAYS as u32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("icemaint.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            warehouse_path = "/tmp/wh"

            [retention]
            orphan_grace_period_days = 5
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.warehouse_path, PathBuf::from("/tmp/wh"));
        assert_eq!(config.retention.orphan_grace_period_days, 5);
    }

    #[test]
    fn test_retry_policies() {
        let config = Config::default();
        let commit = config.commit_retry();
        assert_eq!(commit.max_retries, 3);
        assert_eq!(commit.base_delay, Duration::from_millis(100));
        assert_eq!(config.io_retry().max_delay, Duration::from_millis(5000));
    }
}
