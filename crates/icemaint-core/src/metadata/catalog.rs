//! Catalog collaborator.
//!
//! The catalog owns the table metadata pointer. The engine reads it at the
//! start of every operation and mutates it only through a compare-and-swap
//! [`Catalog::commit`] keyed on the metadata version it read.

use super::manifest::Manifest;
use super::model::{
    FileReference, Operation, Snapshot, SnapshotSummary, TableIdent, TableMetadata,
};
use crate::error::CatalogError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A snapshot the engine wants committed.
///
/// The catalog materializes the actual [`Snapshot`] (id, parent, summary)
/// from the proposal and the metadata it holds at commit time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotProposal {
    /// Operation recorded on the new snapshot
    pub operation: Option<Operation>,
    /// Files added by this snapshot
    pub added_files: Vec<FileReference>,
    /// Paths removed by this snapshot
    pub removed_files: Vec<String>,
    /// Free-form properties
    pub properties: HashMap<String, String>,
}

impl SnapshotProposal {
    /// A `replace` proposal swapping `removed` for `added`.
    pub fn replace(added_files: Vec<FileReference>, removed_files: Vec<String>) -> Self {
        Self {
            operation: Some(Operation::Replace),
            added_files,
            removed_files,
            properties: HashMap::new(),
        }
    }

    /// An `append` proposal.
    pub fn append(added_files: Vec<FileReference>) -> Self {
        Self {
            operation: Some(Operation::Append),
            added_files,
            removed_files: Vec::new(),
            properties: HashMap::new(),
        }
    }

    /// Attach a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn operation(&self) -> Operation {
        self.operation.unwrap_or(match (
            self.added_files.is_empty(),
            self.removed_files.is_empty(),
        ) {
            (false, true) => Operation::Append,
            (true, false) => Operation::Delete,
            _ => Operation::Overwrite,
        })
    }
}

/// Commit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableUpdate {
    /// Add a snapshot and make it current
    AddSnapshot(SnapshotProposal),
    /// Drop snapshots from history
    RemoveSnapshots(Vec<i64>),
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// New metadata version
    pub version: u64,
    /// Snapshot created by the commit, if any
    pub snapshot_id: Option<i64>,
    /// Commit time
    pub committed_at: DateTime<Utc>,
}

/// Catalog operations used by maintenance.
#[async_trait]
pub trait Catalog: Send + Sync + std::fmt::Debug {
    /// Load the current table metadata.
    async fn load_table(&self, ident: &TableIdent) -> Result<TableMetadata>;

    /// File references of a snapshot.
    async fn manifest(&self, ident: &TableIdent, snapshot: &Snapshot) -> Result<Manifest>;

    /// Atomically apply `update` if the table is still at `expected_version`.
    ///
    /// Returns [`CatalogError::VersionConflict`] when another writer
    /// committed first.
    async fn commit(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        update: TableUpdate,
    ) -> Result<CommitOutcome>;
}

/// A snapshot ready to be recorded, with the manifest it points to.
#[derive(Debug, Clone)]
pub struct PreparedSnapshot {
    /// The snapshot
    pub snapshot: Snapshot,
    /// Its file references
    pub entries: Vec<FileReference>,
}

/// Build the snapshot produced by applying `proposal` on top of the current
/// manifest.
///
/// Every removed path must be live in `current`; the new manifest is
/// `current - removed + added`.
pub fn prepare_snapshot(
    metadata: &TableMetadata,
    current: &Manifest,
    proposal: &SnapshotProposal,
    manifest_list: String,
    timestamp: DateTime<Utc>,
) -> Result<PreparedSnapshot> {
    let removed: HashSet<&str> = proposal.removed_files.iter().map(String::as_str).collect();
    let current_paths: HashSet<&str> = current.iter().map(|f| f.path.as_str()).collect();

    if let Some(missing) = removed.iter().find(|p| !current_paths.contains(*p)) {
        return Err(CatalogError::Validation(format!(
            "removed file '{}' is not live in the current snapshot",
            missing
        ))
        .into());
    }

    if let Some(dup) = proposal
        .added_files
        .iter()
        .find(|f| current_paths.contains(f.path.as_str()) && !removed.contains(f.path.as_str()))
    {
        return Err(CatalogError::Validation(format!(
            "added file '{}' is already live",
            dup.path
        ))
        .into());
    }

    let removed_rows: u64 = current
        .iter()
        .filter(|f| removed.contains(f.path.as_str()))
        .map(|f| f.record_count)
        .sum();
    let added_rows: u64 = proposal.added_files.iter().map(|f| f.record_count).sum();

    let mut entries: Vec<FileReference> = current
        .iter()
        .filter(|f| !removed.contains(f.path.as_str()))
        .cloned()
        .collect();
    entries.extend(proposal.added_files.iter().cloned());

    let snapshot_id = next_snapshot_id(metadata);

    let summary = SnapshotSummary {
        added_files: proposal.added_files.len() as u64,
        removed_files: removed.len() as u64,
        added_rows,
        removed_rows,
        total_files: entries.len() as u64,
        total_rows: entries.iter().map(|f| f.record_count).sum(),
    };

    Ok(PreparedSnapshot {
        snapshot: Snapshot {
            snapshot_id,
            parent_id: metadata.current_snapshot_id,
            timestamp,
            operation: proposal.operation(),
            manifest_list,
            summary,
            properties: proposal.properties.clone(),
        },
        entries,
    })
}

/// Id the next committed snapshot receives.
///
/// Never reuses the id of an expired snapshot.
pub fn next_snapshot_id(metadata: &TableMetadata) -> i64 {
    metadata
        .snapshots
        .iter()
        .map(|s| s.snapshot_id)
        .fold(metadata.last_snapshot_id, i64::max)
        + 1
}

/// Check that `ids` can be dropped from `metadata`'s history.
pub fn validate_snapshot_removal(metadata: &TableMetadata, ids: &[i64]) -> Result<()> {
    for id in ids {
        if metadata.current_snapshot_id == Some(*id) {
            return Err(CatalogError::Validation(format!(
                "cannot remove current snapshot {}",
                id
            ))
            .into());
        }
        if metadata.snapshot(*id).is_none() {
            return Err(CatalogError::SnapshotNotFound(*id).into());
        }
    }
    Ok(())
}

/// Reject a commit made against an outdated version.
pub fn check_version(metadata: &TableMetadata, expected_version: u64) -> Result<()> {
    if metadata.version != expected_version {
        return Err(CatalogError::VersionConflict {
            expected: expected_version,
            actual: metadata.version,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::{PartitionKey, TableSchema};
    use crate::Error;

    fn file(path: &str, rows: u64) -> FileReference {
        FileReference::new(path, PartitionKey::unpartitioned(), 1024, rows)
    }

    fn metadata_with(current: Option<i64>, ids: &[i64]) -> TableMetadata {
        TableMetadata {
            ident: TableIdent::new("db", "t"),
            version: 3,
            location: "db/t".into(),
            schema: TableSchema::default(),
            current_snapshot_id: current,
            snapshots: ids
                .iter()
                .map(|id| Snapshot {
                    snapshot_id: *id,
                    parent_id: None,
                    timestamp: Utc::now(),
                    operation: Operation::Append,
                    manifest_list: format!("m-{}", id),
                    summary: SnapshotSummary::default(),
                    properties: HashMap::new(),
                })
                .collect(),
            last_snapshot_id: ids.iter().copied().max().unwrap_or(0),
        }
    }

    #[test]
    fn test_prepare_replace_snapshot() {
        let meta = metadata_with(Some(2), &[1, 2]);
        let current = Manifest::new(vec![file("a", 10), file("b", 20), file("c", 5)]);
        let proposal = SnapshotProposal::replace(vec![file("ab", 30)], vec!["a".into(), "b".into()]);

        let prepared =
            prepare_snapshot(&meta, &current, &proposal, "m-3".into(), Utc::now()).unwrap();

        assert_eq!(prepared.snapshot.snapshot_id, 3);
        assert_eq!(prepared.snapshot.parent_id, Some(2));
        assert_eq!(prepared.snapshot.operation, Operation::Replace);
        assert_eq!(prepared.snapshot.summary.added_files, 1);
        assert_eq!(prepared.snapshot.summary.removed_files, 2);
        assert_eq!(prepared.snapshot.summary.removed_rows, 30);
        assert_eq!(prepared.snapshot.summary.total_rows, 35);

        let paths: Vec<&str> = prepared.entries.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["c", "ab"]);
    }

    #[test]
    fn test_prepare_rejects_dead_removal() {
        let meta = metadata_with(Some(1), &[1]);
        let current = Manifest::new(vec![file("a", 10)]);
        let proposal = SnapshotProposal::replace(vec![file("x", 10)], vec!["gone".into()]);

        let err = prepare_snapshot(&meta, &current, &proposal, "m".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Catalog(CatalogError::Validation(_))));
    }

    #[test]
    fn test_snapshot_removal_validation() {
        let meta = metadata_with(Some(2), &[1, 2]);

        assert!(validate_snapshot_removal(&meta, &[1]).is_ok());
        assert!(matches!(
            validate_snapshot_removal(&meta, &[2]).unwrap_err(),
            Error::Catalog(CatalogError::Validation(_))
        ));
        assert!(matches!(
            validate_snapshot_removal(&meta, &[9]).unwrap_err(),
            Error::Catalog(CatalogError::SnapshotNotFound(9))
        ));
    }

    #[test]
    fn test_next_id_skips_expired_ids() {
        let mut meta = metadata_with(Some(1), &[1, 2]);
        assert_eq!(next_snapshot_id(&meta), 3);

        meta.snapshots.retain(|s| s.snapshot_id == 1);
        assert_eq!(next_snapshot_id(&meta), 3);

        // Metadata written before the counter existed
        meta.last_snapshot_id = 0;
        assert_eq!(next_snapshot_id(&meta), 2);
    }

    #[test]
    fn test_version_check() {
        let meta = metadata_with(None, &[]);
        assert!(check_version(&meta, 3).is_ok());
        assert!(check_version(&meta, 2).unwrap_err().is_version_conflict());
    }

    #[test]
    fn test_proposal_operation_inference() {
        assert_eq!(
            SnapshotProposal {
                added_files: vec![file("a", 1)],
                ..Default::default()
            }
            .operation(),
            Operation::Append
        );
        assert_eq!(
            SnapshotProposal {
                removed_files: vec!["a".into()],
                ..Default::default()
            }
            .operation(),
            Operation::Delete
        );
    }
}
