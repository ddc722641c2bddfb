//! Orphan file cleanup for snapshot-versioned tables.
//!
//! Cleans up files under the table's data directory that no snapshot in
//! metadata references: outputs of failed or abandoned writes, and files
//! left behind by interrupted expiry.
//!
//! ## Cleanup Strategy
//!
//! 1. **Live set**: Union of the manifests of every snapshot in metadata
//! 2. **List**: Stream `{location}/data/` page by page
//! 3. **Filter**: Keep unreferenced files older than the grace period
//! 4. **Delete**: Hand candidates to the executor in bounded chunks
//!
//! The grace period protects files written by operations that have not
//! committed yet. Metadata is never modified. Counts are exact; at most
//! `path_limit` orphan and failed paths are kept for the report.

use super::stats::OrphanResult;
use super::MaintenanceContext;
use crate::metadata::{live_files, RetentionPolicy, TableIdent};
use crate::metrics::OperationKind;
use crate::storage::StoredFile;
use crate::Result;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Default cap on paths kept in an [`OrphanResult`].
pub const DEFAULT_PATH_LIMIT: usize = 1_000;

/// Caller overrides for orphan removal.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrphanOptions {
    /// Unreferenced files younger than this many days are kept
    pub grace_days: Option<u64>,
    /// Report candidates without deleting
    #[serde(default)]
    pub dry_run: bool,
}

/// Orphan cleanup task.
#[derive(Debug)]
pub struct OrphanCleanupTask {
    ctx: MaintenanceContext,
    ident: TableIdent,
    policy: RetentionPolicy,
    dry_run: bool,
    path_limit: usize,
}

impl OrphanCleanupTask {
    /// Create a new orphan cleanup task.
    pub fn new(ctx: MaintenanceContext, ident: TableIdent, policy: RetentionPolicy) -> Self {
        Self {
            ctx,
            ident,
            policy,
            dry_run: false,
            path_limit: DEFAULT_PATH_LIMIT,
        }
    }

    /// Only report candidates.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Keep at most `limit` paths of each kind in the result.
    pub fn with_path_limit(mut self, limit: usize) -> Self {
        self.path_limit = limit;
        self
    }

    /// Run the orphan cleanup task.
    pub async fn run(&self) -> Result<OrphanResult> {
        self.ctx.metrics.record_run(OperationKind::RemoveOrphanFiles);
        debug!(
            table = %self.ident,
            grace_period_secs = self.policy.orphan_grace_period.num_seconds(),
            dry_run = self.dry_run,
            "Starting orphan cleanup task"
        );

        let metadata = self.ctx.catalog.load_table(&self.ident).await?;
        let live = live_files(self.ctx.catalog.as_ref(), &self.ident, &metadata.snapshots).await?;
        let prefix = metadata.data_location();
        let now = Utc::now();

        debug!(
            table = %self.ident,
            prefix = %prefix,
            live_files = live.len(),
            "Scanning data directory"
        );

        let mut result = OrphanResult {
            dry_run: self.dry_run,
            ..Default::default()
        };
        let mut listed = 0u64;
        let mut too_recent = 0u64;
        let mut chunk: Vec<StoredFile> = Vec::with_capacity(self.ctx.delete_chunk_size);

        let mut listing = self.ctx.storage.list(&prefix);
        while let Some(entry) = listing.next().await {
            let file = entry?;
            listed += 1;

            if live.contains(&file.path) {
                continue;
            }
            if !self.policy.past_grace_period(file.last_modified, now) {
                too_recent += 1;
                continue;
            }

            result.orphan_files += 1;
            let truncated = &mut result.paths_truncated;
            self.record_path(&mut result.orphan_paths, &file.path, truncated);

            if !self.dry_run {
                chunk.push(file);
                if chunk.len() >= self.ctx.delete_chunk_size {
                    self.delete_chunk(std::mem::take(&mut chunk), &mut result)
                        .await;
                }
            }
        }
        drop(listing);

        if !chunk.is_empty() {
            self.delete_chunk(chunk, &mut result).await;
        }

        info!(
            table = %self.ident,
            listed_files = listed,
            within_grace_period = too_recent,
            orphan_files = result.orphan_files,
            deleted_files = result.deleted_files,
            failed_deletes = result.failed_deletes,
            bytes_freed = result.bytes_freed,
            dry_run = self.dry_run,
            "Orphan cleanup task completed"
        );

        Ok(result)
    }

    async fn delete_chunk(&self, files: Vec<StoredFile>, result: &mut OrphanResult) {
        let sizes: HashMap<String, u64> = files
            .into_iter()
            .map(|f| (f.path, f.size_bytes))
            .collect();

        let report = self
            .ctx
            .executor
            .delete_files(&self.ctx.storage, sizes.keys().cloned().collect())
            .await;

        for (path, ()) in report.succeeded {
            result.deleted_files += 1;
            result.bytes_freed += sizes.get(&path).copied().unwrap_or(0);
        }
        let failed = report
            .failed
            .into_iter()
            .map(|f| f.item)
            .chain(report.cancelled);
        for path in failed {
            result.failed_deletes += 1;
            let truncated = &mut result.paths_truncated;
            self.record_path(&mut result.failed_paths, &path, truncated);
        }
    }

    fn record_path(&self, paths: &mut Vec<String>, path: &str, truncated: &mut bool) {
        if paths.len() < self.path_limit {
            paths.push(path.to_string());
        } else {
            *truncated = true;
        }
    }
}
