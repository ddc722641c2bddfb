//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use icemaint_core::codec::{FileCodec, ParquetCodec};
use icemaint_core::config::Config;
use icemaint_core::error::{CatalogError, StorageError, StorageErrorKind};
use icemaint_core::metadata::{
    Catalog, CommitOutcome, FieldType, FileReference, InMemoryCatalog, Manifest, PartitionKey,
    SchemaField, Snapshot, SnapshotProposal, TableIdent, TableMetadata, TableSchema, TableUpdate,
};
use icemaint_core::storage::{ObjectStoreStorage, Storage, StoredFile};
use icemaint_core::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const LOCATION: &str = "wh/db/events";

pub fn ident() -> TableIdent {
    TableIdent::new("db", "events")
}

pub fn arrow_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("region", DataType::Utf8, true),
        Field::new("value", DataType::Float64, true),
    ]))
}

pub fn table_schema() -> TableSchema {
    TableSchema::new(vec![
        SchemaField::new("id", FieldType::Long),
        SchemaField::new("region", FieldType::String),
        SchemaField::new("value", FieldType::Double),
    ])
}

/// Configuration with millisecond backoff so retries do not slow tests down.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.commit.base_delay_ms = 1;
    config.commit.max_delay_ms = 5;
    config.io.base_delay_ms = 1;
    config.io.max_delay_ms = 5;
    config.io.max_workers = 2;
    config.memory.read_batch_rows = 64;
    config
}

pub fn batch(ids: Range<i64>, region: &str) -> RecordBatch {
    let ids: Vec<i64> = ids.collect();
    let regions: Vec<&str> = ids.iter().map(|_| region).collect();
    let values: Vec<f64> = ids.iter().map(|id| *id as f64 * 0.5).collect();

    RecordBatch::try_new(
        arrow_schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(regions)),
            Arc::new(Float64Array::from(values)),
        ],
    )
    .unwrap()
}

pub fn encode(ids: Range<i64>, region: &str) -> Bytes {
    ParquetCodec::default()
        .encode(arrow_schema(), &[batch(ids, region)])
        .unwrap()
}

/// Write a Parquet file under the table's data directory.
///
/// Files are partitioned by region when `partitioned` is set.
pub async fn put_file(
    storage: &dyn Storage,
    name: &str,
    ids: Range<i64>,
    region: &str,
    partitioned: bool,
) -> FileReference {
    let rows = (ids.end - ids.start) as u64;
    let data = encode(ids, region);
    let (partition, path) = if partitioned {
        (
            PartitionKey::from_pairs([("region", region)]),
            format!("{}/data/region={}/{}", LOCATION, region, name),
        )
    } else {
        (
            PartitionKey::unpartitioned(),
            format!("{}/data/{}", LOCATION, name),
        )
    };

    let size = data.len() as u64;
    storage.write(&path, data).await.unwrap();
    FileReference::new(path, partition, size, rows)
}

/// Decode every `id` in a data file.
pub async fn read_ids(storage: &dyn Storage, path: &str) -> Vec<i64> {
    let data = storage.read(path).await.unwrap();
    let mut ids = Vec::new();
    for batch in ParquetCodec::default().decode(data, 0, 1024).unwrap() {
        let batch = batch.unwrap();
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        ids.extend((0..column.len()).map(|i| column.value(i)));
    }
    ids
}

/// Files referenced by the current snapshot.
pub async fn current_files(catalog: &dyn Catalog, ident: &TableIdent) -> Vec<FileReference> {
    let metadata = catalog.load_table(ident).await.unwrap();
    match metadata.current_snapshot() {
        Some(snapshot) => catalog
            .manifest(ident, snapshot)
            .await
            .unwrap()
            .entries()
            .to_vec(),
        None => Vec::new(),
    }
}

/// Every id stored in the current snapshot, sorted.
pub async fn current_ids(
    catalog: &dyn Catalog,
    storage: &dyn Storage,
    ident: &TableIdent,
) -> Vec<i64> {
    let mut ids = Vec::new();
    for file in current_files(catalog, ident).await {
        ids.extend(read_ids(storage, &file.path).await);
    }
    ids.sort_unstable();
    ids
}

/// In-memory storage with controllable modification times and failures.
#[derive(Debug)]
pub struct TestStorage {
    inner: ObjectStoreStorage,
    modified: Mutex<HashMap<String, DateTime<Utc>>>,
    failing_reads: Mutex<HashMap<String, (StorageErrorKind, u32)>>,
    failing_deletes: Mutex<HashSet<String>>,
    cancel_on_read: Mutex<Option<CancellationToken>>,
    pub reads: AtomicU32,
}

impl TestStorage {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreStorage::in_memory(),
            modified: Mutex::new(HashMap::new()),
            failing_reads: Mutex::new(HashMap::new()),
            failing_deletes: Mutex::new(HashSet::new()),
            cancel_on_read: Mutex::new(None),
            reads: AtomicU32::new(0),
        }
    }

    /// Report `path` as last modified at `at`.
    pub fn set_modified(&self, path: &str, at: DateTime<Utc>) {
        self.modified.lock().insert(path.to_string(), at);
    }

    /// Fail the next `times` reads of `path` with `kind`.
    pub fn fail_reads(&self, path: &str, kind: StorageErrorKind, times: u32) {
        self.failing_reads
            .lock()
            .insert(path.to_string(), (kind, times));
    }

    /// Fail every delete of `path`.
    pub fn fail_deletes(&self, path: &str) {
        self.failing_deletes.lock().insert(path.to_string());
    }

    pub fn allow_deletes(&self, path: &str) {
        self.failing_deletes.lock().remove(path);
    }

    /// Drop every injected read and delete failure.
    pub fn clear_failures(&self) {
        self.failing_reads.lock().clear();
        self.failing_deletes.lock().clear();
    }

    /// Fire `token` during the next read, which then completes slowly.
    pub fn cancel_on_next_read(&self, token: CancellationToken) {
        *self.cancel_on_read.lock() = Some(token);
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.inner.read(path).await.is_ok()
    }

    /// Every path under `prefix`, sorted.
    pub async fn paths(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list(prefix)
            .map_ok(|f| f.path)
            .try_collect()
            .await
            .unwrap();
        paths.sort();
        paths
    }
}

#[async_trait]
impl Storage for TestStorage {
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<StoredFile>> {
        self.inner
            .list(prefix)
            .map(move |entry| {
                entry.map(|mut file| {
                    if let Some(at) = self.modified.lock().get(&file.path) {
                        file.last_modified = *at;
                    }
                    file
                })
            })
            .boxed()
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel_on_read.lock().take();
        if let Some(token) = cancel {
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        {
            let mut failing = self.failing_reads.lock();
            if let Some((kind, remaining)) = failing.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StorageError::new(*kind, path, "injected read failure").into());
                }
            }
        }
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.inner.write(path, data).await
    }

    async fn write_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
        self.inner.write_if_absent(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.failing_deletes.lock().contains(path) {
            return Err(StorageError::new(
                StorageErrorKind::Permanent,
                path,
                "injected delete failure",
            )
            .into());
        }
        self.inner.delete(path).await
    }
}

/// Lets another writer commit right before the first commit goes through.
#[derive(Debug)]
pub struct RacingCatalog {
    inner: Arc<InMemoryCatalog>,
    race: Mutex<Option<SnapshotProposal>>,
}

impl RacingCatalog {
    pub fn new(inner: Arc<InMemoryCatalog>, race: SnapshotProposal) -> Self {
        Self {
            inner,
            race: Mutex::new(Some(race)),
        }
    }
}

#[async_trait]
impl Catalog for RacingCatalog {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableMetadata> {
        self.inner.load_table(ident).await
    }

    async fn manifest(&self, ident: &TableIdent, snapshot: &Snapshot) -> Result<Manifest> {
        self.inner.manifest(ident, snapshot).await
    }

    async fn commit(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        update: TableUpdate,
    ) -> Result<CommitOutcome> {
        let race = self.race.lock().take();
        if let Some(proposal) = race {
            let current = self.inner.load_table(ident).await?;
            self.inner
                .commit(ident, current.version, TableUpdate::AddSnapshot(proposal))
                .await?;
        }
        self.inner.commit(ident, expected_version, update).await
    }
}

/// Rejects every commit with a version conflict.
#[derive(Debug)]
pub struct ConflictingCatalog {
    inner: Arc<InMemoryCatalog>,
}

impl ConflictingCatalog {
    pub fn new(inner: Arc<InMemoryCatalog>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Catalog for ConflictingCatalog {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableMetadata> {
        self.inner.load_table(ident).await
    }

    async fn manifest(&self, ident: &TableIdent, snapshot: &Snapshot) -> Result<Manifest> {
        self.inner.manifest(ident, snapshot).await
    }

    async fn commit(
        &self,
        _ident: &TableIdent,
        expected_version: u64,
        _update: TableUpdate,
    ) -> Result<CommitOutcome> {
        Err(CatalogError::VersionConflict {
            expected: expected_version,
            actual: expected_version + 1,
        }
        .into())
    }
}
