//! File compaction for snapshot-versioned tables.
//!
//! ## Compaction Strategy
//!
//! 1. **Load**: Refresh table metadata and the current snapshot's manifest
//! 2. **Plan**: Bin-pack small files per partition into rewrite groups
//! 3. **Rewrite**: Run groups concurrently through the I/O executor
//! 4. **Commit**: Swap inputs for outputs in one `replace` snapshot
//! 5. **Cleanup**: Delete outputs that did not make it into a commit

use super::commit::RewriteCommitter;
use super::planner::{CompactionPlanner, RewritePlan};
use super::rewrite::{rewrite_group, CompletedGroup};
use super::stats::CompactionResult;
use super::MaintenanceContext;
use crate::error::Error;
use crate::memory::MemoryGuard;
use crate::metadata::{Manifest, TableIdent, TableMetadata};
use crate::metrics::OperationKind;
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Caller overrides for a compaction; unset fields come from configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompactOptions {
    /// Target output file size in bytes
    pub target_file_size_bytes: Option<u64>,
    /// Maximum input files per rewrite group
    pub max_files_per_group: Option<usize>,
    /// Only rewrite files that may match this predicate
    pub filter: Option<String>,
}

impl CompactOptions {
    /// Set the target output size.
    pub fn with_target_file_size_bytes(mut self, bytes: u64) -> Self {
        self.target_file_size_bytes = Some(bytes);
        self
    }

    /// Set the group size cap.
    pub fn with_max_files_per_group(mut self, count: usize) -> Self {
        self.max_files_per_group = Some(count);
        self
    }

    /// Restrict compaction to files matching `filter`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Compaction task for one table.
#[derive(Debug)]
pub struct CompactionTask {
    ctx: MaintenanceContext,
    ident: TableIdent,
    target_file_size_bytes: u64,
    max_files_per_group: usize,
    filter: Option<String>,
    sort_keys: Option<Vec<String>>,
}

impl CompactionTask {
    /// Create a new compaction task.
    pub fn new(
        ctx: MaintenanceContext,
        ident: TableIdent,
        target_file_size_bytes: u64,
        max_files_per_group: usize,
    ) -> Self {
        Self {
            ctx,
            ident,
            target_file_size_bytes,
            max_files_per_group,
            filter: None,
            sort_keys: None,
        }
    }

    /// Only consider files the filter may match.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Sort rewritten rows by these keys.
    pub fn with_sort_keys(mut self, sort_keys: Vec<String>) -> Self {
        self.sort_keys = Some(sort_keys);
        self
    }

    fn kind(&self) -> OperationKind {
        if self.sort_keys.is_some() {
            OperationKind::SortCompact
        } else {
            OperationKind::Compact
        }
    }

    /// Build the rewrite plan for `metadata` without touching any file.
    pub fn plan(&self, metadata: &TableMetadata, manifest: &Manifest) -> Result<RewritePlan> {
        let mut planner = CompactionPlanner::new(self.target_file_size_bytes, self.max_files_per_group)
            .with_filter(self.filter.clone());
        if let Some(keys) = &self.sort_keys {
            planner = planner.with_sort_keys(keys.clone());
        }

        Ok(planner.plan(
            &metadata.schema,
            metadata.current_snapshot_id,
            manifest.entries(),
        )?)
    }

    /// Run the compaction task.
    pub async fn run(&self) -> Result<CompactionResult> {
        let kind = self.kind();
        self.ctx.metrics.record_run(kind);
        debug!(
            table = %self.ident,
            operation = kind.as_label(),
            target_file_size_bytes = self.target_file_size_bytes,
            max_files_per_group = self.max_files_per_group,
            "Starting compaction task"
        );

        let metadata = self.ctx.catalog.load_table(&self.ident).await?;
        let manifest = match metadata.current_snapshot() {
            Some(snapshot) => self.ctx.catalog.manifest(&self.ident, snapshot).await?,
            None => Manifest::default(),
        };

        let plan = self.plan(&metadata, &manifest)?;
        if plan.is_empty() {
            info!(table = %self.ident, files = manifest.len(), "Nothing to compact");
            return Ok(CompactionResult::default());
        }

        info!(
            table = %self.ident,
            groups = plan.groups.len(),
            input_files = plan.input_file_count(),
            snapshot_id = ?plan.snapshot_id,
            "Planned compaction"
        );

        let (completed, failed_groups) = self.rewrite(&metadata, &plan).await?;
        if completed.is_empty() {
            warn!(
                table = %self.ident,
                failed_groups = failed_groups,
                "No group rewritten, nothing to commit"
            );
            self.ctx.metrics.record_groups(0, 0, failed_groups);
            return Ok(CompactionResult {
                failed_groups,
                ..Default::default()
            });
        }

        if self.ctx.cancel.is_cancelled() {
            self.discard(&completed).await;
            return Err(Error::Cancelled);
        }

        let committer = RewriteCommitter::new(&self.ctx, &self.ident)
            .with_property("maintenance", kind.as_label());
        let report = match committer.commit(metadata.version, completed.clone()).await {
            Ok(report) => report,
            Err(e) => {
                self.discard(&completed).await;
                return Err(e);
            }
        };

        let committed = &report.committed;
        let rewritten_files = committed.iter().map(|g| g.group.inputs.len() as u64).sum();
        let result = CompactionResult {
            rewritten_files,
            added_files: committed.iter().map(|g| g.outputs.len() as u64).sum(),
            removed_files: rewritten_files,
            rewritten_rows: committed.iter().map(CompletedGroup::output_rows).sum(),
            rewritten_bytes: committed.iter().map(|g| g.group.input_bytes()).sum(),
            skipped_groups: report.skipped.len() as u64,
            failed_groups,
            commit_retries: u64::from(report.retries),
            snapshot_id: report.outcome.as_ref().and_then(|o| o.snapshot_id),
            added_paths: committed
                .iter()
                .flat_map(|g| g.outputs.iter().map(|f| f.path.clone()))
                .collect(),
            removed_paths: committed.iter().flat_map(|g| g.group.input_paths()).collect(),
        };

        self.ctx.metrics.record_groups(
            committed.len() as u64,
            result.skipped_groups,
            result.failed_groups,
        );
        self.ctx.metrics.record_rows_rewritten(result.rewritten_rows);

        info!(
            table = %self.ident,
            rewritten_files = result.rewritten_files,
            added_files = result.added_files,
            rewritten_rows = result.rewritten_rows,
            skipped_groups = result.skipped_groups,
            failed_groups = result.failed_groups,
            commit_retries = result.commit_retries,
            "Compaction task completed"
        );

        Ok(result)
    }

    /// Rewrite every group, returning the completed ones and the failure count.
    ///
    /// Fails as a whole on cancellation or when the memory guard trips; the
    /// outputs of completed groups are deleted first.
    async fn rewrite(
        &self,
        metadata: &TableMetadata,
        plan: &RewritePlan,
    ) -> Result<(Vec<CompletedGroup>, u64)> {
        let guard = Arc::new(MemoryGuard::new(self.ctx.memory_limit));
        let ctx = &self.ctx;
        let guard = &guard;
        let location = metadata.location.as_str();
        let target = plan.target_file_size_bytes;

        let report = self
            .ctx
            .executor
            .run_batch((0..plan.groups.len()).collect(), move |index: usize| {
                let group = &plan.groups[index];
                async move { rewrite_group(ctx, location, group, target, guard).await }
            })
            .await;

        let completed: Vec<CompletedGroup> =
            report.succeeded.into_iter().map(|(_, group)| group).collect();

        let mut fatal = None;
        let mut failed_groups = 0u64;
        for failed in report.failed {
            match failed.error {
                e @ (Error::MemoryLimitExceeded { .. } | Error::Cancelled) => {
                    fatal.get_or_insert(e);
                }
                e => {
                    failed_groups += 1;
                    warn!(
                        table = %self.ident,
                        partition = %plan.groups[failed.item].partition,
                        attempts = failed.attempts,
                        error = %e,
                        "Rewrite group failed, continuing"
                    );
                }
            }
        }

        if !report.cancelled.is_empty() || self.ctx.cancel.is_cancelled() {
            fatal.get_or_insert(Error::Cancelled);
        }

        if let Some(e) = fatal {
            warn!(table = %self.ident, error = %e, "Stopping compaction");
            self.discard(&completed).await;
            return Err(e);
        }

        Ok((completed, failed_groups))
    }

    /// Delete the outputs of groups that will not be committed.
    async fn discard(&self, groups: &[CompletedGroup]) {
        let outputs: Vec<String> = groups
            .iter()
            .flat_map(|g| g.outputs.iter().map(|f| f.path.clone()))
            .collect();
        if outputs.is_empty() {
            return;
        }

        let report = self
            .ctx
            .cleanup_executor()
            .delete_files(&self.ctx.storage, outputs)
            .await;
        debug!(
            table = %self.ident,
            deleted = report.succeeded.len(),
            failed = report.failed.len(),
            "Discarded uncommitted outputs"
        );
    }
}
