//! Operation results.

use serde::Serialize;
use std::collections::BTreeMap;

/// Flat counters reported by every procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats(BTreeMap<String, u64>);

impl Stats {
    /// Counter value, zero when absent.
    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Set a counter.
    pub fn insert(&mut self, key: impl Into<String>, value: u64) {
        self.0.insert(key.into(), value);
    }

    /// Iterate counters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// The underlying map.
    pub fn into_inner(self) -> BTreeMap<String, u64> {
        self.0
    }
}

impl<const N: usize> From<[(&str, u64); N]> for Stats {
    fn from(pairs: [(&str, u64); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Result of a compaction or sort compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionResult {
    /// Input files replaced by the committed snapshot
    pub rewritten_files: u64,
    /// Output files added by the committed snapshot
    pub added_files: u64,
    /// Files removed by the committed snapshot
    pub removed_files: u64,
    /// Rows moved from inputs to outputs
    pub rewritten_rows: u64,
    /// Input bytes of committed groups
    pub rewritten_bytes: u64,
    /// Groups dropped because an input was rewritten concurrently
    pub skipped_groups: u64,
    /// Groups that failed with an I/O error
    pub failed_groups: u64,
    /// Commit attempts beyond the first
    pub commit_retries: u64,
    /// Snapshot created, if anything was committed
    pub snapshot_id: Option<i64>,
    /// Paths added
    pub added_paths: Vec<String>,
    /// Paths removed
    pub removed_paths: Vec<String>,
}

impl CompactionResult {
    /// Whether some groups did not make it into the commit.
    pub fn completed_with_failures(&self) -> bool {
        self.failed_groups > 0
    }
}

impl From<&CompactionResult> for Stats {
    fn from(r: &CompactionResult) -> Self {
        Stats::from([
            ("rewritten_files", r.rewritten_files),
            ("added_files", r.added_files),
            ("removed_files", r.removed_files),
            ("rewritten_rows", r.rewritten_rows),
            ("rewritten_bytes", r.rewritten_bytes),
            ("skipped_groups", r.skipped_groups),
            ("failed_groups", r.failed_groups),
            ("commit_retries", r.commit_retries),
        ])
    }
}

/// Result of snapshot expiry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpirationResult {
    /// Snapshots removed from history (or that would be, on a dry run)
    pub expired_snapshots: u64,
    /// Data files deleted
    pub deleted_files: u64,
    /// Deletes that failed after retries
    pub failed_deletes: u64,
    /// Expired snapshot ids
    pub expired_snapshot_ids: Vec<i64>,
    /// Paths deleted (or deletable, on a dry run)
    pub deleted_paths: Vec<String>,
    /// Paths whose delete failed
    pub failed_paths: Vec<String>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

impl From<&ExpirationResult> for Stats {
    fn from(r: &ExpirationResult) -> Self {
        Stats::from([
            ("expired_snapshots", r.expired_snapshots),
            ("deleted_files", r.deleted_files),
            ("failed_deletes", r.failed_deletes),
        ])
    }
}

/// Result of orphan removal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrphanResult {
    /// Unreferenced files past the grace period
    pub orphan_files: u64,
    /// Files deleted
    pub deleted_files: u64,
    /// Deletes that failed after retries
    pub failed_deletes: u64,
    /// Bytes reclaimed by deleted files
    pub bytes_freed: u64,
    /// Orphan paths found, up to the task's path limit
    pub orphan_paths: Vec<String>,
    /// Paths whose delete failed, up to the task's path limit
    pub failed_paths: Vec<String>,
    /// Whether either path list hit the limit
    pub paths_truncated: bool,
    /// Whether this was a dry run
    pub dry_run: bool,
}

impl From<&OrphanResult> for Stats {
    fn from(r: &OrphanResult) -> Self {
        Stats::from([
            ("orphan_files", r.orphan_files),
            ("deleted_files", r.deleted_files),
            ("failed_deletes", r.failed_deletes),
            ("bytes_freed", r.bytes_freed),
        ])
    }
}

macro_rules! stats_from_owned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Stats {
            fn from(r: $ty) -> Self {
                Stats::from(&r)
            }
        })*
    };
}

stats_from_owned!(CompactionResult, ExpirationResult, OrphanResult);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compaction_stats_keys() {
        let stats = Stats::from(CompactionResult {
            rewritten_files: 6,
            added_files: 1,
            removed_files: 6,
            rewritten_rows: 600,
            ..Default::default()
        });

        let keys: Vec<&str> = stats.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                "added_files",
                "commit_retries",
                "failed_groups",
                "removed_files",
                "rewritten_bytes",
                "rewritten_files",
                "rewritten_rows",
                "skipped_groups",
            ]
        );
        assert_eq!(stats.get("rewritten_rows"), 600);
        assert_eq!(stats.get("nope"), 0);
    }

    #[test]
    fn test_gc_stats() {
        let expiry = Stats::from(ExpirationResult {
            expired_snapshots: 2,
            deleted_files: 5,
            ..Default::default()
        });
        assert_eq!(expiry.get("expired_snapshots"), 2);
        assert_eq!(expiry.get("failed_deletes"), 0);

        let orphans = Stats::from(OrphanResult {
            orphan_files: 3,
            bytes_freed: 1024,
            ..Default::default()
        });
        assert_eq!(orphans.get("bytes_freed"), 1024);
        assert_eq!(serde_json::to_value(&orphans).unwrap()["orphan_files"], 3);
    }
}
