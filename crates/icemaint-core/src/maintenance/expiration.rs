//! Snapshot expiration for snapshot-versioned tables.
//!
//! ## Expiration Strategy
//!
//! 1. **Split**: Partition history into retained and expired snapshots
//! 2. **Diff**: Files of expired manifests not in any retained manifest
//! 3. **Commit**: Remove the expired snapshots, retrying on conflicts with a
//!    plan rebuilt from fresh metadata
//! 4. **Delete**: Remove the unreachable files through the I/O executor

use super::planner::DeletePlan;
use super::stats::ExpirationResult;
use super::MaintenanceContext;
use crate::error::Error;
use crate::metadata::{
    live_files, RetentionPolicy, Snapshot, TableIdent, TableMetadata, TableUpdate,
};
use crate::metrics::OperationKind;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Caller overrides for snapshot expiry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExpireOptions {
    /// Snapshots younger than this many days are kept
    pub max_age_days: Option<u64>,
    /// Always keep at least this many snapshots
    pub min_retain: Option<usize>,
    /// Report without committing or deleting
    #[serde(default)]
    pub dry_run: bool,
}

/// Expiry plan for one metadata version.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpirationPlan {
    /// Metadata version the plan was built from
    pub version: u64,
    /// Snapshots to remove, in history order
    pub expired: Vec<i64>,
    /// Files that become unreachable
    pub deletes: DeletePlan,
}

fn select<'a>(metadata: &'a TableMetadata, ids: &[i64]) -> Vec<&'a Snapshot> {
    metadata
        .snapshots
        .iter()
        .filter(|s| ids.contains(&s.snapshot_id))
        .collect()
}

/// Expiration task that removes old snapshots and their unreachable files.
#[derive(Debug)]
pub struct ExpirationTask {
    ctx: MaintenanceContext,
    ident: TableIdent,
    policy: RetentionPolicy,
    dry_run: bool,
}

impl ExpirationTask {
    /// Create a new expiration task.
    pub fn new(ctx: MaintenanceContext, ident: TableIdent, policy: RetentionPolicy) -> Self {
        Self {
            ctx,
            ident,
            policy,
            dry_run: false,
        }
    }

    /// Only report what would be expired.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Build the expiry plan for `metadata` at `now`.
    pub async fn plan(&self, metadata: &TableMetadata, now: DateTime<Utc>) -> Result<ExpirationPlan> {
        let split = self.policy.split(metadata, now);

        let retained_files = live_files(
            self.ctx.catalog.as_ref(),
            &self.ident,
            select(metadata, &split.retained),
        )
        .await?;

        let mut unreachable: BTreeMap<String, u64> = BTreeMap::new();
        for snapshot in select(metadata, &split.expired) {
            let manifest = self.ctx.catalog.manifest(&self.ident, snapshot).await?;
            for file in &manifest {
                if !retained_files.contains(&file.path) {
                    unreachable.insert(file.path.clone(), file.file_size_bytes);
                }
            }
        }

        let deletes = DeletePlan {
            total_bytes: unreachable.values().sum(),
            paths: unreachable.into_keys().collect(),
        };

        Ok(ExpirationPlan {
            version: metadata.version,
            expired: split.expired,
            deletes,
        })
    }

    /// Run the expiration task.
    pub async fn run(&self) -> Result<ExpirationResult> {
        self.ctx.metrics.record_run(OperationKind::ExpireSnapshots);
        debug!(
            table = %self.ident,
            max_snapshot_age_secs = self.policy.max_snapshot_age.num_seconds(),
            min_snapshots_to_keep = self.policy.min_snapshots_to_keep,
            dry_run = self.dry_run,
            "Starting expiration task"
        );

        let mut retries = 0u32;
        let plan = loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let metadata = self.ctx.catalog.load_table(&self.ident).await?;
            let plan = self.plan(&metadata, Utc::now()).await?;

            if plan.expired.is_empty() {
                info!(
                    table = %self.ident,
                    snapshots = metadata.snapshots.len(),
                    "No snapshots to expire"
                );
                return Ok(ExpirationResult {
                    dry_run: self.dry_run,
                    ..Default::default()
                });
            }

            if self.dry_run {
                info!(
                    table = %self.ident,
                    expired = plan.expired.len(),
                    deletable_files = plan.deletes.paths.len(),
                    deletable_bytes = plan.deletes.total_bytes,
                    "Dry run, nothing committed"
                );
                return Ok(ExpirationResult {
                    expired_snapshots: plan.expired.len() as u64,
                    deleted_files: plan.deletes.paths.len() as u64,
                    expired_snapshot_ids: plan.expired,
                    deleted_paths: plan.deletes.paths,
                    dry_run: true,
                    ..Default::default()
                });
            }

            let update = TableUpdate::RemoveSnapshots(plan.expired.clone());
            match self
                .ctx
                .catalog
                .commit(&self.ident, plan.version, update)
                .await
            {
                Ok(outcome) => {
                    self.ctx.metrics.record_commit();
                    info!(
                        table = %self.ident,
                        version = outcome.version,
                        expired = plan.expired.len(),
                        "Expired snapshots"
                    );
                    break plan;
                }
                Err(e) if e.is_version_conflict() => {
                    self.ctx.metrics.record_conflict();
                    retries += 1;
                    if retries > self.ctx.commit_retry.max_retries {
                        self.ctx.metrics.record_abort();
                        return Err(Error::MaintenanceAborted {
                            attempts: retries,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.ctx.commit_retry.backoff(retries);
                    warn!(
                        table = %self.ident,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Expiry commit conflict, replanning"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.ctx
            .metrics
            .record_snapshots_expired(plan.expired.len() as u64);

        let mut result = ExpirationResult {
            expired_snapshots: plan.expired.len() as u64,
            expired_snapshot_ids: plan.expired,
            ..Default::default()
        };

        for chunk in plan.deletes.paths.chunks(self.ctx.delete_chunk_size) {
            let report = self
                .ctx
                .executor
                .delete_files(&self.ctx.storage, chunk.to_vec())
                .await;

            result
                .deleted_paths
                .extend(report.succeeded.into_iter().map(|(path, ())| path));
            result
                .failed_paths
                .extend(report.failed.into_iter().map(|f| f.item));
            result.failed_paths.extend(report.cancelled);
        }

        result.deleted_files = result.deleted_paths.len() as u64;
        result.failed_deletes = result.failed_paths.len() as u64;

        info!(
            table = %self.ident,
            expired_snapshots = result.expired_snapshots,
            deleted_files = result.deleted_files,
            failed_deletes = result.failed_deletes,
            "Expiration task completed"
        );

        Ok(result)
    }
}
