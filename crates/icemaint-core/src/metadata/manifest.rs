//! Manifests and the live-file set.

use super::catalog::Catalog;
use super::model::{FileReference, Snapshot, TableIdent};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;

/// The file references belonging to one snapshot.
///
/// Cloning shares the underlying entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    entries: Arc<[FileReference]>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Manifest {
    /// Build a manifest from its entries.
    pub fn new(entries: Vec<FileReference>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> std::slice::Iter<'_, FileReference> {
        self.entries.iter()
    }

    /// Number of data files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest lists no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `path` is listed.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|f| f.path == path)
    }

    /// Entries as a slice.
    pub fn entries(&self) -> &[FileReference] {
        &self.entries
    }

    /// Total rows across all files.
    pub fn total_rows(&self) -> u64 {
        self.entries.iter().map(|f| f.record_count).sum()
    }

    /// Paths of all listed files.
    pub fn paths(&self) -> HashSet<String> {
        self.entries.iter().map(|f| f.path.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a FileReference;
    type IntoIter = std::slice::Iter<'a, FileReference>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Union of the files referenced by `snapshots`.
///
/// A file is safe to keep as long as any of the given snapshots still
/// references it, so callers pass every retained snapshot, not only the
/// current one.
pub async fn live_files<'a, I>(
    catalog: &dyn Catalog,
    ident: &TableIdent,
    snapshots: I,
) -> Result<HashSet<String>>
where
    I: IntoIterator<Item = &'a Snapshot>,
{
    let mut live = HashSet::new();
    for snapshot in snapshots {
        let manifest = catalog.manifest(ident, snapshot).await?;
        live.extend(manifest.iter().map(|f| f.path.clone()));
    }
    Ok(live)
}
