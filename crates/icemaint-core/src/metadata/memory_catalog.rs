//! In-process catalog.

use super::catalog::{
    check_version, next_snapshot_id, prepare_snapshot, validate_snapshot_removal, Catalog,
    CommitOutcome, SnapshotProposal, TableUpdate,
};
use super::manifest::Manifest;
use super::model::{Snapshot, TableIdent, TableMetadata, TableSchema};
use crate::error::CatalogError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
struct TableState {
    metadata: TableMetadata,
    manifests: HashMap<String, Manifest>,
}

/// Catalog holding all metadata in memory.
///
/// Commits are serialized by a lock, giving the same compare-and-swap
/// semantics as a remote catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<TableIdent, TableState>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with no snapshots.
    pub fn create_table(
        &self,
        ident: &TableIdent,
        location: impl Into<String>,
        schema: TableSchema,
    ) -> Result<TableMetadata> {
        let mut tables = self.tables.write();
        if tables.contains_key(ident) {
            return Err(CatalogError::TableExists(ident.to_string()).into());
        }

        let metadata = TableMetadata {
            ident: ident.clone(),
            version: 1,
            location: location.into(),
            schema,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            last_snapshot_id: 0,
        };

        tables.insert(
            ident.clone(),
            TableState {
                metadata: metadata.clone(),
                manifests: HashMap::new(),
            },
        );

        Ok(metadata)
    }

    /// Commit a snapshot with an explicit timestamp, bypassing the version check.
    ///
    /// Used to seed history.
    pub fn import_snapshot(
        &self,
        ident: &TableIdent,
        proposal: SnapshotProposal,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(ident)
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;
        let snapshot = apply_proposal(state, &proposal, timestamp)?;
        Ok(snapshot.snapshot_id)
    }

    /// Point the table at an existing snapshot.
    pub fn set_current_snapshot(&self, ident: &TableIdent, snapshot_id: i64) -> Result<()> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(ident)
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;
        if state.metadata.snapshot(snapshot_id).is_none() {
            return Err(CatalogError::SnapshotNotFound(snapshot_id).into());
        }
        state.metadata.current_snapshot_id = Some(snapshot_id);
        state.metadata.version += 1;
        Ok(())
    }
}

fn apply_proposal(
    state: &mut TableState,
    proposal: &SnapshotProposal,
    timestamp: DateTime<Utc>,
) -> Result<Snapshot> {
    let current = match state.metadata.current_snapshot() {
        Some(snapshot) => state
            .manifests
            .get(&snapshot.manifest_list)
            .cloned()
            .unwrap_or_default(),
        None => Manifest::default(),
    };

    let next_id = next_snapshot_id(&state.metadata);
    let manifest_list = format!(
        "{}/snap-{}.manifest",
        state.metadata.metadata_location(),
        next_id
    );

    let prepared =
        prepare_snapshot(&state.metadata, &current, proposal, manifest_list, timestamp)?;
    let snapshot = prepared.snapshot;

    state.manifests.insert(
        snapshot.manifest_list.clone(),
        Manifest::new(prepared.entries),
    );
    state.metadata.current_snapshot_id = Some(snapshot.snapshot_id);
    state.metadata.snapshots.push(snapshot.clone());
    state.metadata.last_snapshot_id = snapshot.snapshot_id;
    state.metadata.version += 1;

    Ok(snapshot)
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableMetadata> {
        self.tables
            .read()
            .get(ident)
            .map(|state| state.metadata.clone())
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()).into())
    }

    async fn manifest(&self, ident: &TableIdent, snapshot: &Snapshot) -> Result<Manifest> {
        let tables = self.tables.read();
        let state = tables
            .get(ident)
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;
        state
            .manifests
            .get(&snapshot.manifest_list)
            .cloned()
            .ok_or_else(|| CatalogError::SnapshotNotFound(snapshot.snapshot_id).into())
    }

    async fn commit(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        update: TableUpdate,
    ) -> Result<CommitOutcome> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(ident)
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;

        check_version(&state.metadata, expected_version)?;
        let committed_at = Utc::now();

        let snapshot_id = match update {
            TableUpdate::AddSnapshot(proposal) => {
                let snapshot = apply_proposal(state, &proposal, committed_at)?;
                Some(snapshot.snapshot_id)
            }
            TableUpdate::RemoveSnapshots(ids) => {
                validate_snapshot_removal(&state.metadata, &ids)?;
                let removed: Vec<Snapshot> = state
                    .metadata
                    .snapshots
                    .iter()
                    .filter(|s| ids.contains(&s.snapshot_id))
                    .cloned()
                    .collect();
                state
                    .metadata
                    .snapshots
                    .retain(|s| !ids.contains(&s.snapshot_id));
                for snapshot in &removed {
                    state.manifests.remove(&snapshot.manifest_list);
                }
                state.metadata.version += 1;
                None
            }
        };

        debug!(
            table = %ident,
            version = state.metadata.version,
            snapshot_id = ?snapshot_id,
            "Committed table update"
        );

        Ok(CommitOutcome {
            version: state.metadata.version,
            snapshot_id,
            committed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::{FieldType, FileReference, PartitionKey, SchemaField};

    fn file(path: &str) -> FileReference {
        FileReference::new(path, PartitionKey::unpartitioned(), 100, 10)
    }

    fn setup() -> (InMemoryCatalog, TableIdent) {
        let catalog = InMemoryCatalog::new();
        let ident = TableIdent::new("db", "events");
        catalog
            .create_table(
                &ident,
                "db/events",
                TableSchema::new(vec![SchemaField::new("id", FieldType::Long)]),
            )
            .unwrap();
        (catalog, ident)
    }

    #[tokio::test]
    async fn test_commit_and_manifest() {
        let (catalog, ident) = setup();
        let meta = catalog.load_table(&ident).await.unwrap();

        let outcome = catalog
            .commit(
                &ident,
                meta.version,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("a"), file("b")])),
            )
            .await
            .unwrap();
        assert_eq!(outcome.snapshot_id, Some(1));
        assert_eq!(outcome.version, meta.version + 1);

        let meta = catalog.load_table(&ident).await.unwrap();
        let current = meta.current_snapshot().unwrap();
        let manifest = catalog.manifest(&ident, current).await.unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let (catalog, ident) = setup();
        let stale = catalog.load_table(&ident).await.unwrap().version;

        catalog
            .import_snapshot(&ident, SnapshotProposal::append(vec![file("a")]), Utc::now())
            .unwrap();

        let err = catalog
            .commit(
                &ident,
                stale,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("b")])),
            )
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_remove_snapshots() {
        let (catalog, ident) = setup();
        let first = catalog
            .import_snapshot(&ident, SnapshotProposal::append(vec![file("a")]), Utc::now())
            .unwrap();
        let second = catalog
            .import_snapshot(&ident, SnapshotProposal::append(vec![file("b")]), Utc::now())
            .unwrap();

        let meta = catalog.load_table(&ident).await.unwrap();
        let err = catalog
            .commit(&ident, meta.version, TableUpdate::RemoveSnapshots(vec![second]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Catalog(CatalogError::Validation(_))
        ));

        catalog
            .commit(&ident, meta.version, TableUpdate::RemoveSnapshots(vec![first]))
            .await
            .unwrap();
        let meta = catalog.load_table(&ident).await.unwrap();
        assert_eq!(meta.snapshots.len(), 1);
        assert_eq!(meta.current_snapshot_id, Some(second));
    }

    #[tokio::test]
    async fn test_expired_ids_are_not_reused() {
        let (catalog, ident) = setup();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(
                catalog
                    .import_snapshot(&ident, SnapshotProposal::append(vec![file(name)]), Utc::now())
                    .unwrap(),
            );
        }

        // Roll back, then drop the newest snapshot
        catalog.set_current_snapshot(&ident, ids[0]).unwrap();
        let meta = catalog.load_table(&ident).await.unwrap();
        catalog
            .commit(&ident, meta.version, TableUpdate::RemoveSnapshots(vec![ids[2]]))
            .await
            .unwrap();

        let meta = catalog.load_table(&ident).await.unwrap();
        assert_eq!(meta.last_snapshot_id, ids[2]);
        let outcome = catalog
            .commit(
                &ident,
                meta.version,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("d")])),
            )
            .await
            .unwrap();
        assert_eq!(outcome.snapshot_id, Some(ids[2] + 1));
    }

    #[tokio::test]
    async fn test_duplicate_table() {
        let (catalog, ident) = setup();
        assert!(catalog
            .create_table(&ident, "db/events", TableSchema::default())
            .is_err());
    }
}
