//! Committing rewritten groups with optimistic concurrency.
//!
//! All completed groups go into one `replace` snapshot. When another writer
//! wins the race, the table is reloaded and any group whose inputs are no
//! longer all live is dropped (its outputs deleted) before trying again.

use super::rewrite::CompletedGroup;
use super::MaintenanceContext;
use crate::error::Error;
use crate::metadata::{live_files, CommitOutcome, SnapshotProposal, TableIdent, TableUpdate};
use crate::Result;
use tracing::{debug, info, warn};

/// Outcome of committing a set of groups.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Catalog outcome, `None` when nothing was left to commit
    pub outcome: Option<CommitOutcome>,
    /// Groups in the committed snapshot
    pub committed: Vec<CompletedGroup>,
    /// Groups dropped because an input was rewritten concurrently
    pub skipped: Vec<CompletedGroup>,
    /// Commit attempts beyond the first
    pub retries: u32,
}

/// Commits completed rewrite groups for one table.
#[derive(Debug)]
pub struct RewriteCommitter<'a> {
    ctx: &'a MaintenanceContext,
    ident: &'a TableIdent,
    properties: Vec<(String, String)>,
}

impl<'a> RewriteCommitter<'a> {
    /// Create a committer.
    pub fn new(ctx: &'a MaintenanceContext, ident: &'a TableIdent) -> Self {
        Self {
            ctx,
            ident,
            properties: Vec::new(),
        }
    }

    /// Record a property on the committed snapshot.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    fn proposal(&self, groups: &[CompletedGroup]) -> SnapshotProposal {
        let added = groups
            .iter()
            .flat_map(|g| g.outputs.iter().cloned())
            .collect();
        let removed = groups.iter().flat_map(|g| g.group.input_paths()).collect();

        self.properties.iter().fold(
            SnapshotProposal::replace(added, removed)
                .with_property("rewritten-groups", groups.len().to_string()),
            |proposal, (k, v)| proposal.with_property(k.clone(), v.clone()),
        )
    }

    /// Commit `groups` against `version`, retrying on conflicts.
    ///
    /// Returns [`Error::MaintenanceAborted`] once `commit.max_retries`
    /// retries are spent. Outputs of skipped groups are deleted here; on
    /// error the caller owns cleanup of the remaining outputs.
    pub async fn commit(&self, version: u64, groups: Vec<CompletedGroup>) -> Result<CommitReport> {
        let mut version = version;
        let mut pending = groups;
        let mut skipped = Vec::new();
        let mut retries = 0u32;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if pending.is_empty() {
                debug!(table = %self.ident, "No groups left to commit");
                return Ok(CommitReport {
                    outcome: None,
                    committed: Vec::new(),
                    skipped,
                    retries,
                });
            }

            let update = TableUpdate::AddSnapshot(self.proposal(&pending));
            let err = match self.ctx.catalog.commit(self.ident, version, update).await {
                Ok(outcome) => {
                    self.ctx.metrics.record_commit();
                    info!(
                        table = %self.ident,
                        version = outcome.version,
                        snapshot_id = ?outcome.snapshot_id,
                        groups = pending.len(),
                        retries = retries,
                        "Committed rewrite"
                    );
                    return Ok(CommitReport {
                        outcome: Some(outcome),
                        committed: pending,
                        skipped,
                        retries,
                    });
                }
                Err(e) if e.is_version_conflict() => e,
                Err(e) => return Err(e),
            };

            self.ctx.metrics.record_conflict();
            retries += 1;

            if retries > self.ctx.commit_retry.max_retries {
                self.ctx.metrics.record_abort();
                warn!(
                    table = %self.ident,
                    attempts = retries,
                    error = %err,
                    "Commit retries exhausted"
                );
                return Err(Error::MaintenanceAborted {
                    attempts: retries,
                    reason: err.to_string(),
                });
            }

            let delay = self.ctx.commit_retry.backoff(retries);
            warn!(
                table = %self.ident,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Commit conflict, reloading table"
            );
            tokio::time::sleep(delay).await;

            let metadata = self.ctx.catalog.load_table(self.ident).await?;
            let live = live_files(
                self.ctx.catalog.as_ref(),
                self.ident,
                metadata.current_snapshot(),
            )
            .await?;

            let (still_valid, lost): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|g| g.group.inputs.iter().all(|f| live.contains(&f.path)));

            if !lost.is_empty() {
                info!(
                    table = %self.ident,
                    skipped = lost.len(),
                    remaining = still_valid.len(),
                    "Skipping groups rewritten concurrently"
                );
                let outputs = lost
                    .iter()
                    .flat_map(|g| g.outputs.iter().map(|f| f.path.clone()))
                    .collect();
                self.ctx
                    .cleanup_executor()
                    .delete_files(&self.ctx.storage, outputs)
                    .await;
            }

            skipped.extend(lost);
            pending = still_valid;
            version = metadata.version;
        }
    }
}
