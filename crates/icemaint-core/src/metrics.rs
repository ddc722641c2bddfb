//! Maintenance metrics with Prometheus text export.

use std::sync::atomic::{AtomicU64, Ordering};

/// Maintenance operation kinds, used as a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Bin-pack compaction
    Compact,
    /// Sort compaction
    SortCompact,
    /// Snapshot expiry
    ExpireSnapshots,
    /// Orphan removal
    RemoveOrphanFiles,
}

impl OperationKind {
    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            OperationKind::Compact => "compact",
            OperationKind::SortCompact => "sort_compact",
            OperationKind::ExpireSnapshots => "expire_snapshots",
            OperationKind::RemoveOrphanFiles => "remove_orphan_files",
        }
    }

    const ALL: [OperationKind; 4] = [
        OperationKind::Compact,
        OperationKind::SortCompact,
        OperationKind::ExpireSnapshots,
        OperationKind::RemoveOrphanFiles,
    ];
}

/// Counters shared by every operation of one engine.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    runs_compact: AtomicU64,
    runs_sort_compact: AtomicU64,
    runs_expire: AtomicU64,
    runs_orphans: AtomicU64,

    /// Successful catalog commits
    commits_total: AtomicU64,
    /// Commits rejected with a version conflict
    commit_conflicts_total: AtomicU64,
    /// Operations aborted after exhausting commit retries
    aborts_total: AtomicU64,

    /// Rewrite groups committed
    groups_rewritten_total: AtomicU64,
    /// Rewrite groups dropped after a conflict
    groups_skipped_total: AtomicU64,
    /// Rewrite groups that failed with an I/O error
    groups_failed_total: AtomicU64,

    /// Rows rewritten by committed groups
    rows_rewritten_total: AtomicU64,
    /// Snapshots removed from history
    snapshots_expired_total: AtomicU64,
    /// Files deleted from storage
    files_deleted_total: AtomicU64,
    /// File deletes that failed after retries
    delete_failures_total: AtomicU64,
    /// Retries of individual file operations
    io_retries_total: AtomicU64,
}

impl MaintenanceMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self, kind: OperationKind) -> &AtomicU64 {
        match kind {
            OperationKind::Compact => &self.runs_compact,
            OperationKind::SortCompact => &self.runs_sort_compact,
            OperationKind::ExpireSnapshots => &self.runs_expire,
            OperationKind::RemoveOrphanFiles => &self.runs_orphans,
        }
    }

    /// Record the start of an operation.
    pub fn record_run(&self, kind: OperationKind) {
        self.runs(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful commit.
    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a version conflict.
    pub fn record_conflict(&self) {
        self.commit_conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an aborted operation.
    pub fn record_abort(&self) {
        self.aborts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rewrite group outcomes.
    pub fn record_groups(&self, rewritten: u64, skipped: u64, failed: u64) {
        self.groups_rewritten_total
            .fetch_add(rewritten, Ordering::Relaxed);
        self.groups_skipped_total.fetch_add(skipped, Ordering::Relaxed);
        self.groups_failed_total.fetch_add(failed, Ordering::Relaxed);
    }

    /// Record rewritten rows.
    pub fn record_rows_rewritten(&self, rows: u64) {
        self.rows_rewritten_total.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record expired snapshots.
    pub fn record_snapshots_expired(&self, count: u64) {
        self.snapshots_expired_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record deleted files.
    pub fn record_files_deleted(&self, count: u64) {
        self.files_deleted_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Record failed deletes.
    pub fn record_delete_failures(&self, count: u64) {
        self.delete_failures_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record file operation retries.
    pub fn record_io_retries(&self, count: u64) {
        self.io_retries_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Operations started, by kind.
    pub fn runs_total(&self, kind: OperationKind) -> u64 {
        self.runs(kind).load(Ordering::Relaxed)
    }

    /// Successful commits.
    pub fn commits_total(&self) -> u64 {
        self.commits_total.load(Ordering::Relaxed)
    }

    /// Version conflicts.
    pub fn commit_conflicts_total(&self) -> u64 {
        self.commit_conflicts_total.load(Ordering::Relaxed)
    }

    /// Aborted operations.
    pub fn aborts_total(&self) -> u64 {
        self.aborts_total.load(Ordering::Relaxed)
    }

    /// Committed rewrite groups.
    pub fn groups_rewritten_total(&self) -> u64 {
        self.groups_rewritten_total.load(Ordering::Relaxed)
    }

    /// Skipped rewrite groups.
    pub fn groups_skipped_total(&self) -> u64 {
        self.groups_skipped_total.load(Ordering::Relaxed)
    }

    /// Failed rewrite groups.
    pub fn groups_failed_total(&self) -> u64 {
        self.groups_failed_total.load(Ordering::Relaxed)
    }

    /// Rewritten rows.
    pub fn rows_rewritten_total(&self) -> u64 {
        self.rows_rewritten_total.load(Ordering::Relaxed)
    }

    /// Expired snapshots.
    pub fn snapshots_expired_total(&self) -> u64 {
        self.snapshots_expired_total.load(Ordering::Relaxed)
    }

    /// Deleted files.
    pub fn files_deleted_total(&self) -> u64 {
        self.files_deleted_total.load(Ordering::Relaxed)
    }

    /// Failed deletes.
    pub fn delete_failures_total(&self) -> u64 {
        self.delete_failures_total.load(Ordering::Relaxed)
    }

    /// File operation retries.
    pub fn io_retries_total(&self) -> u64 {
        self.io_retries_total.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("icemaint")
    }

    /// Export metrics in Prometheus text format with a custom prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(2048);

        output.push_str(&format!(
            "# HELP {prefix}_operations_total Maintenance operations started\n"
        ));
        output.push_str(&format!("# TYPE {prefix}_operations_total counter\n"));
        for kind in OperationKind::ALL {
            output.push_str(&format!(
                "{prefix}_operations_total{{operation=\"{}\"}} {}\n",
                kind.as_label(),
                self.runs_total(kind)
            ));
        }
        output.push('\n');

        let counters: [(&str, &str, u64); 11] = [
            ("commits_total", "Successful catalog commits", self.commits_total()),
            (
                "commit_conflicts_total",
                "Catalog commits rejected with a version conflict",
                self.commit_conflicts_total(),
            ),
            (
                "aborts_total",
                "Operations aborted after exhausting commit retries",
                self.aborts_total(),
            ),
            (
                "groups_rewritten_total",
                "Rewrite groups committed",
                self.groups_rewritten_total(),
            ),
            (
                "groups_skipped_total",
                "Rewrite groups dropped after a conflict",
                self.groups_skipped_total(),
            ),
            (
                "groups_failed_total",
                "Rewrite groups that failed with an I/O error",
                self.groups_failed_total(),
            ),
            (
                "rows_rewritten_total",
                "Rows rewritten by committed groups",
                self.rows_rewritten_total(),
            ),
            (
                "snapshots_expired_total",
                "Snapshots removed from table history",
                self.snapshots_expired_total(),
            ),
            (
                "files_deleted_total",
                "Files deleted from storage",
                self.files_deleted_total(),
            ),
            (
                "delete_failures_total",
                "File deletes that failed after retries",
                self.delete_failures_total(),
            ),
            (
                "io_retries_total",
                "Retries of individual file operations",
                self.io_retries_total(),
            ),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
            output.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
            output.push_str(&format!("{prefix}_{name} {value}\n"));
            output.push('\n');
        }

        output
    }
}
