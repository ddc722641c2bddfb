//! Procedure dispatch against a local warehouse.

mod common;

use common::*;
use icemaint_core::error::{CatalogError, Error, PlanningError, ProcedureError};
use icemaint_core::metadata::{
    Catalog, FileCatalog, FileReference, InMemoryCatalog, PartitionKey, SnapshotProposal,
    TableUpdate,
};
use icemaint_core::storage::Storage;
use icemaint_core::{Config, MaintenanceEngine, ProcedureDispatcher};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TABLE: &str = "db/events";

async fn local_warehouse(dir: &TempDir) -> (ProcedureDispatcher, FileCatalog) {
    let mut config = test_config();
    config.storage.warehouse_path = dir.path().join("warehouse");

    let engine = MaintenanceEngine::open_local(config).unwrap();
    let catalog = FileCatalog::new(engine.storage().clone(), "");
    catalog.create_table(&ident(), table_schema()).await.unwrap();

    (ProcedureDispatcher::new(Arc::new(engine)), catalog)
}

async fn write_data_file(storage: &dyn Storage, name: &str, start: i64) -> FileReference {
    let data = encode(start..start + 10, "us");
    let path = format!("{}/data/{}", TABLE, name);
    let size = data.len() as u64;
    storage.write(&path, data).await.unwrap();
    FileReference::new(path, PartitionKey::unpartitioned(), size, 10)
}

#[tokio::test]
async fn test_maintenance_cycle_on_local_warehouse() {
    let dir = TempDir::new().unwrap();
    let (dispatcher, catalog) = local_warehouse(&dir).await;
    let storage = dispatcher.engine().storage().clone();

    let mut files = Vec::new();
    for (i, name) in ["a.parquet", "b.parquet", "c.parquet"].into_iter().enumerate() {
        files.push(write_data_file(storage.as_ref(), name, i as i64 * 10).await);
    }
    catalog
        .commit(&ident(), 1, TableUpdate::AddSnapshot(SnapshotProposal::append(files.clone())))
        .await
        .unwrap();

    // Alias and case-insensitive lookup
    let stats = dispatcher
        .call("REWRITE_DATA_FILES", json!({"table": "db.events"}))
        .await
        .unwrap();
    assert_eq!(stats.get("rewritten_files"), 3);
    assert_eq!(stats.get("added_files"), 1);
    assert_eq!(stats.get("rewritten_rows"), 30);

    let ids = current_ids(&catalog, storage.as_ref(), &ident()).await;
    assert_eq!(ids, (0..30).collect::<Vec<_>>());

    // The pre-compaction snapshot goes, taking the small files with it
    let stats = dispatcher
        .call(
            "expire_snapshots",
            json!({"table": "db.events", "max_age_days": 0, "min_retain": 1}),
        )
        .await
        .unwrap();
    assert_eq!(stats.get("expired_snapshots"), 1);
    assert_eq!(stats.get("deleted_files"), 3);
    for file in &files {
        assert!(storage.read(&file.path).await.is_err());
    }

    let metadata = catalog.load_table(&ident()).await.unwrap();
    assert_eq!(metadata.snapshots.len(), 1);

    let leftover = write_data_file(storage.as_ref(), "leftover.parquet", 100).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = dispatcher
        .call(
            "remove_orphan_files",
            json!({"table": "db.events", "grace_days": 0}),
        )
        .await
        .unwrap();
    assert_eq!(stats.get("orphan_files"), 1);
    assert_eq!(stats.get("deleted_files"), 1);
    assert_eq!(stats.get("bytes_freed"), leftover.file_size_bytes);

    let ids = current_ids(&catalog, storage.as_ref(), &ident()).await;
    assert_eq!(ids, (0..30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_sort_compact_procedure() {
    let dir = TempDir::new().unwrap();
    let (dispatcher, catalog) = local_warehouse(&dir).await;
    let storage = dispatcher.engine().storage().clone();

    let files = vec![
        write_data_file(storage.as_ref(), "a.parquet", 0).await,
        write_data_file(storage.as_ref(), "b.parquet", 10).await,
    ];
    catalog
        .commit(&ident(), 1, TableUpdate::AddSnapshot(SnapshotProposal::append(files)))
        .await
        .unwrap();

    let stats = dispatcher
        .call(
            "sort_compact",
            json!({"table": "db.events", "sort_keys": ["id DESC"]}),
        )
        .await
        .unwrap();
    assert_eq!(stats.get("rewritten_files"), 2);

    let outputs = current_files(&catalog, &ident()).await;
    assert_eq!(outputs.len(), 1);
    let ids = read_ids(storage.as_ref(), &outputs[0].path).await;
    assert_eq!(ids, (0..20).rev().collect::<Vec<_>>());
}

fn untouched_dispatcher() -> (ProcedureDispatcher, Arc<TestStorage>) {
    let storage = Arc::new(TestStorage::new());
    let engine = MaintenanceEngine::new(
        test_config(),
        Arc::new(InMemoryCatalog::new()),
        storage.clone(),
    )
    .unwrap();
    (ProcedureDispatcher::new(Arc::new(engine)), storage)
}

#[tokio::test]
async fn test_invalid_calls_fail_before_io() {
    let (dispatcher, storage) = untouched_dispatcher();

    let err = dispatcher
        .call("optimize", json!({"table": "db.events"}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Procedure(ProcedureError::UnknownProcedure(_))
    ));

    let err = dispatcher
        .call("compact", json!({"table": "db.events", "filter": "region ~ 'us'"}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Planning(PlanningError::InvalidFilter { .. })
    ));

    let err = dispatcher
        .call("sort_compact", json!({"table": "db.events", "sort_keys": []}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Procedure(ProcedureError::InvalidParameters { .. })
    ));

    let err = dispatcher
        .call("expire_snapshots", json!({"table": "db.events", "keep": 3}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Procedure(ProcedureError::InvalidParameters { .. })
    ));

    assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_valid_call_on_missing_table() {
    let (dispatcher, _storage) = untouched_dispatcher();

    let err = dispatcher
        .call("remove_orphan_files", json!({"table": "db.missing"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::TableNotFound(_))));
}

#[tokio::test]
async fn test_engine_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("icemaint.toml");
    let warehouse = dir.path().join("wh");
    std::fs::write(
        &path,
        format!(
            r#"
            [storage]
            warehouse_path = "{}"

            [compaction]
            max_files_per_group = 4

            [retention]
            min_snapshots_to_keep = 2
            "#,
            warehouse.display()
        ),
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    let engine = MaintenanceEngine::open_local(config).unwrap();
    assert!(warehouse.is_dir());
    assert_eq!(engine.config().compaction.max_files_per_group, 4);
    assert_eq!(engine.config().retention.min_snapshots_to_keep, 2);
}
