//! Storage collaborator.
//!
//! The engine only needs list / read / write / delete against a flat key
//! space. [`ObjectStoreStorage`] adapts any [`ObjectStore`] (local disk,
//! S3, GCS, in-memory) to that surface.

use crate::error::{StorageError, StorageErrorKind};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode};
use std::sync::Arc;

/// A file found by [`Storage::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Storage key, without a leading slash
    pub path: String,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    pub size_bytes: u64,
}

/// File-level storage operations used by maintenance.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Lazily list every file under `prefix`. Implementations page through
    /// the backing store rather than materializing the listing.
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<StoredFile>>;

    /// Read a whole file.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write (or overwrite) a file.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Write a file only if nothing exists at `path`.
    ///
    /// Fails with [`StorageErrorKind::AlreadyExists`] otherwise.
    async fn write_if_absent(&self, path: &str, data: Bytes) -> Result<()>;

    /// Delete a file.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Strip the leading slash so keys compare equal across stores.
pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Join a base key and a relative key with a single separator.
pub fn join_path(base: &str, rest: &str) -> String {
    let base = normalize_path(base).trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", base, rest)
    }
}

/// [`Storage`] backed by an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    /// Wrap an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Storage rooted at a local directory, created if missing.
    pub fn local(root: &std::path::Path) -> Result<Self> {
        use object_store::local::LocalFileSystem;

        if !root.exists() {
            std::fs::create_dir_all(root)?;
        }

        let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
            StorageError::new(
                StorageErrorKind::Permanent,
                root.display().to_string(),
                format!("Failed to create local file system store: {}", e),
            )
        })?;

        Ok(Self::new(Arc::new(store)))
    }

    /// In-memory storage, mostly useful for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

fn map_store_error(path: &str, err: object_store::Error) -> StorageError {
    let kind = match &err {
        object_store::Error::NotFound { .. } => StorageErrorKind::NotFound,
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StorageErrorKind::AlreadyExists
        }
        object_store::Error::NotSupported { .. } | object_store::Error::InvalidPath { .. } => {
            StorageErrorKind::Permanent
        }
        _ => StorageErrorKind::Transient,
    };
    StorageError::new(kind, path, err.to_string())
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<StoredFile>> {
        let prefix_owned = normalize_path(prefix).to_string();
        let object_prefix = ObjectPath::from(prefix_owned.as_str());

        self.store
            .list(Some(&object_prefix))
            .map(move |item| {
                item.map(|meta| StoredFile {
                    path: meta.location.to_string(),
                    last_modified: meta.last_modified,
                    size_bytes: meta.size as u64,
                })
                .map_err(|e| map_store_error(&prefix_owned, e).into())
            })
            .boxed()
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let location = ObjectPath::from(normalize_path(path));
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_store_error(path, e))?;
        let bytes = result.bytes().await.map_err(|e| map_store_error(path, e))?;
        Ok(bytes)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let location = ObjectPath::from(normalize_path(path));
        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(())
    }

    async fn write_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
        let location = ObjectPath::from(normalize_path(path));
        self.store
            .put_opts(&location, data.into(), PutMode::Create.into())
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = ObjectPath::from(normalize_path(path));
        self.store
            .delete(&location)
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use futures::TryStreamExt;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("db/events", "data/a.parquet"), "db/events/data/a.parquet");
        assert_eq!(join_path("/db/events/", "/data"), "db/events/data");
        assert_eq!(join_path("", "data"), "data");
    }

    #[tokio::test]
    async fn test_roundtrip_and_list() {
        let storage = ObjectStoreStorage::in_memory();
        storage
            .write("db/t/data/a.parquet", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        storage
            .write("/db/t/data/b.parquet", Bytes::from_static(b"defg"))
            .await
            .unwrap();
        storage
            .write("db/t/metadata/v1.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let mut files: Vec<StoredFile> = storage.list("db/t/data").try_collect().await.unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "db/t/data/a.parquet");
        assert_eq!(files[1].size_bytes, 4);

        let data = storage.read("db/t/data/b.parquet").await.unwrap();
        assert_eq!(&data[..], b"defg");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let storage = ObjectStoreStorage::in_memory();
        let err = storage.read("nope.parquet").await.unwrap_err();
        match err {
            Error::Storage(e) => assert!(e.is_not_found()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_write_if_absent() {
        let storage = ObjectStoreStorage::in_memory();
        storage
            .write_if_absent("meta/v1.json", Bytes::from_static(b"1"))
            .await
            .unwrap();

        let err = storage
            .write_if_absent("meta/v1.json", Bytes::from_static(b"2"))
            .await
            .unwrap_err();
        match err {
            Error::Storage(e) => assert_eq!(e.kind, StorageErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }

        let data = storage.read("meta/v1.json").await.unwrap();
        assert_eq!(&data[..], b"1");
    }
}
