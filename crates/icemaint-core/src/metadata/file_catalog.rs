//! Catalog persisted as JSON documents in storage.
//!
//! ## Layout
//!
//! ```text
//! {root}/{namespace}/{name}/metadata/v0000000001.metadata.json
//! {root}/{namespace}/{name}/metadata/v0000000002.metadata.json
//! {root}/{namespace}/{name}/metadata/snap-1-<uuid>.manifest.json
//! ```
//!
//! The highest version file is the current metadata. Version files are
//! written create-only, so two writers racing for the same version cannot
//! both succeed: the loser observes `AlreadyExists` and reports a
//! [`CatalogError::VersionConflict`].

use super::catalog::{
    check_version, next_snapshot_id, prepare_snapshot, validate_snapshot_removal, Catalog,
    CommitOutcome, TableUpdate,
};
use super::manifest::Manifest;
use super::model::{FileReference, Snapshot, TableIdent, TableMetadata, TableSchema};
use crate::error::{CatalogError, StorageErrorKind};
use crate::storage::{join_path, Storage};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const VERSION_PREFIX: &str = "v";
const VERSION_SUFFIX: &str = ".metadata.json";

/// Storage-backed catalog.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    storage: Arc<dyn Storage>,
    root: String,
}

impl FileCatalog {
    /// Create a catalog whose tables live under `root`.
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        Self {
            storage,
            root: root.into(),
        }
    }

    /// Storage location of a table.
    pub fn table_location(&self, ident: &TableIdent) -> String {
        join_path(&self.root, &format!("{}/{}", ident.namespace, ident.name))
    }

    /// Create a table at version 1 with no snapshots.
    pub async fn create_table(
        &self,
        ident: &TableIdent,
        schema: TableSchema,
    ) -> Result<TableMetadata> {
        let metadata = TableMetadata {
            ident: ident.clone(),
            version: 1,
            location: self.table_location(ident),
            schema,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            last_snapshot_id: 0,
        };

        match self.write_version(&metadata).await {
            Ok(()) => {}
            Err(Error::Storage(e)) if e.kind == StorageErrorKind::AlreadyExists => {
                return Err(CatalogError::TableExists(ident.to_string()).into());
            }
            Err(e) => return Err(e),
        }

        info!(table = %ident, location = %metadata.location, "Created table");
        Ok(metadata)
    }

    fn version_path(metadata_location: &str, version: u64) -> String {
        join_path(
            metadata_location,
            &format!("{}{:010}{}", VERSION_PREFIX, version, VERSION_SUFFIX),
        )
    }

    fn parse_version(path: &str) -> Option<u64> {
        let file_name = path.rsplit('/').next()?;
        file_name
            .strip_prefix(VERSION_PREFIX)?
            .strip_suffix(VERSION_SUFFIX)?
            .parse()
            .ok()
    }

    async fn latest_version(&self, ident: &TableIdent) -> Result<Option<u64>> {
        let metadata_location = join_path(&self.table_location(ident), "metadata");
        let versions: Vec<u64> = self
            .storage
            .list(&metadata_location)
            .try_filter_map(|file| async move { Ok(Self::parse_version(&file.path)) })
            .try_collect()
            .await?;
        Ok(versions.into_iter().max())
    }

    async fn write_version(&self, metadata: &TableMetadata) -> Result<()> {
        let path = Self::version_path(&metadata.metadata_location(), metadata.version);
        let body = serde_json::to_vec_pretty(metadata)?;
        self.storage.write_if_absent(&path, Bytes::from(body)).await
    }

    async fn write_manifest(&self, path: &str, entries: &[FileReference]) -> Result<()> {
        let body = serde_json::to_vec(entries)?;
        self.storage.write(path, Bytes::from(body)).await
    }

    async fn delete_best_effort(&self, path: &str) {
        if let Err(e) = self.storage.delete(path).await {
            warn!(path = %path, error = %e, "Failed to delete catalog file, continuing");
        }
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableMetadata> {
        let version = self
            .latest_version(ident)
            .await?
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;

        let path = Self::version_path(
            &join_path(&self.table_location(ident), "metadata"),
            version,
        );
        let body = self.storage.read(&path).await?;
        let metadata: TableMetadata = serde_json::from_slice(&body)?;

        debug!(table = %ident, version = metadata.version, "Loaded table metadata");
        Ok(metadata)
    }

    async fn manifest(&self, _ident: &TableIdent, snapshot: &Snapshot) -> Result<Manifest> {
        let body = match self.storage.read(&snapshot.manifest_list).await {
            Ok(body) => body,
            Err(Error::Storage(e)) if e.is_not_found() => {
                return Err(CatalogError::SnapshotNotFound(snapshot.snapshot_id).into());
            }
            Err(e) => return Err(e),
        };
        let entries: Vec<FileReference> = serde_json::from_slice(&body)?;
        Ok(Manifest::new(entries))
    }

    async fn commit(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        update: TableUpdate,
    ) -> Result<CommitOutcome> {
        let base = self.load_table(ident).await?;
        check_version(&base, expected_version)?;

        let committed_at = Utc::now();
        let mut next = base.clone();
        next.version = base.version + 1;

        let mut written_manifest = None;
        let mut obsolete_manifests = Vec::new();

        let snapshot_id = match &update {
            TableUpdate::AddSnapshot(proposal) => {
                let current = match base.current_snapshot() {
                    Some(snapshot) => self.manifest(ident, snapshot).await?,
                    None => Manifest::default(),
                };

                let manifest_path = join_path(
                    &base.metadata_location(),
                    &format!(
                        "snap-{}-{}.manifest.json",
                        next_snapshot_id(&base),
                        uuid::Uuid::new_v4()
                    ),
                );

                let prepared =
                    prepare_snapshot(&base, &current, proposal, manifest_path, committed_at)?;
                self.write_manifest(&prepared.snapshot.manifest_list, &prepared.entries)
                    .await?;
                written_manifest = Some(prepared.snapshot.manifest_list.clone());

                let snapshot_id = prepared.snapshot.snapshot_id;
                next.current_snapshot_id = Some(snapshot_id);
                next.last_snapshot_id = snapshot_id;
                next.snapshots.push(prepared.snapshot);
                Some(snapshot_id)
            }
            TableUpdate::RemoveSnapshots(ids) => {
                validate_snapshot_removal(&base, ids)?;
                obsolete_manifests = base
                    .snapshots
                    .iter()
                    .filter(|s| ids.contains(&s.snapshot_id))
                    .map(|s| s.manifest_list.clone())
                    .collect();
                next.snapshots.retain(|s| !ids.contains(&s.snapshot_id));
                None
            }
        };

        match self.write_version(&next).await {
            Ok(()) => {}
            Err(Error::Storage(e)) if e.kind == StorageErrorKind::AlreadyExists => {
                if let Some(path) = written_manifest {
                    self.delete_best_effort(&path).await;
                }
                return Err(CatalogError::VersionConflict {
                    expected: expected_version,
                    actual: next.version,
                }
                .into());
            }
            Err(e) => {
                if let Some(path) = written_manifest {
                    self.delete_best_effort(&path).await;
                }
                return Err(e);
            }
        }

        for path in &obsolete_manifests {
            self.delete_best_effort(path).await;
        }

        debug!(
            table = %ident,
            version = next.version,
            snapshot_id = ?snapshot_id,
            "Committed table update"
        );

        Ok(CommitOutcome {
            version: next.version,
            snapshot_id,
            committed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::catalog::SnapshotProposal;
    use crate::metadata::model::{FieldType, PartitionKey, SchemaField};
    use crate::storage::ObjectStoreStorage;

    fn file(path: &str) -> FileReference {
        FileReference::new(path, PartitionKey::unpartitioned(), 100, 10)
    }

    async fn setup() -> (FileCatalog, Arc<dyn Storage>, TableIdent) {
        let storage: Arc<dyn Storage> = Arc::new(ObjectStoreStorage::in_memory());
        let catalog = FileCatalog::new(storage.clone(), "warehouse");
        let ident = TableIdent::new("db", "events");
        catalog
            .create_table(
                &ident,
                TableSchema::new(vec![SchemaField::new("id", FieldType::Long)]),
            )
            .await
            .unwrap();
        (catalog, storage, ident)
    }

    #[test]
    fn test_version_path_parsing() {
        let path = FileCatalog::version_path("w/db/t/metadata", 12);
        assert_eq!(path, "w/db/t/metadata/v0000000012.metadata.json");
        assert_eq!(FileCatalog::parse_version(&path), Some(12));
        assert_eq!(
            FileCatalog::parse_version("w/db/t/metadata/snap-1-x.manifest.json"),
            None
        );
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let (catalog, _, ident) = setup().await;
        let meta = catalog.load_table(&ident).await.unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.location, "warehouse/db/events");
        assert!(meta.current_snapshot_id.is_none());

        let err = catalog
            .create_table(&ident, TableSchema::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(CatalogError::TableExists(_))));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let (catalog, _, _) = setup().await;
        let err = catalog
            .load_table(&TableIdent::new("db", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(CatalogError::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_commit_conflict_and_manifest() {
        let (catalog, _, ident) = setup().await;

        let outcome = catalog
            .commit(
                &ident,
                1,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("a"), file("b")])),
            )
            .await
            .unwrap();
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.snapshot_id, Some(1));

        let err = catalog
            .commit(
                &ident,
                1,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("c")])),
            )
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let meta = catalog.load_table(&ident).await.unwrap();
        let manifest = catalog
            .manifest(&ident, meta.current_snapshot().unwrap())
            .await
            .unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_snapshots_deletes_manifest() {
        let (catalog, storage, ident) = setup().await;
        catalog
            .commit(
                &ident,
                1,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("a")])),
            )
            .await
            .unwrap();
        catalog
            .commit(
                &ident,
                2,
                TableUpdate::AddSnapshot(SnapshotProposal::append(vec![file("b")])),
            )
            .await
            .unwrap();

        let meta = catalog.load_table(&ident).await.unwrap();
        let expired_manifest = meta.snapshot(1).unwrap().manifest_list.clone();

        catalog
            .commit(&ident, 3, TableUpdate::RemoveSnapshots(vec![1]))
            .await
            .unwrap();

        let meta = catalog.load_table(&ident).await.unwrap();
        assert_eq!(meta.version, 4);
        assert_eq!(meta.snapshots.len(), 1);
        assert_eq!(meta.last_snapshot_id, 2);
        assert!(storage.read(&expired_manifest).await.is_err());
    }
}
