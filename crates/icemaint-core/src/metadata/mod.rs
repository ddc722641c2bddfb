//! Table metadata: snapshots, manifests, retention and the catalog.
//!
//! - **model**: table, snapshot and file reference types
//! - **manifest**: per-snapshot file lists and the live-file union
//! - **retention**: which snapshots survive expiry
//! - **catalog**: the compare-and-swap catalog trait and commit payloads
//! - **memory_catalog** / **file_catalog**: reference catalogs

mod catalog;
mod file_catalog;
mod manifest;
mod memory_catalog;
mod model;
pub mod retention;

pub use catalog::{
    check_version, next_snapshot_id, prepare_snapshot, validate_snapshot_removal, Catalog,
    CommitOutcome, PreparedSnapshot, SnapshotProposal, TableUpdate,
};
pub use file_catalog::FileCatalog;
pub use manifest::{live_files, Manifest};
pub use memory_catalog::InMemoryCatalog;
pub use model::{
    ColumnStats, FieldType, FileReference, Literal, Operation, PartitionKey, SchemaField,
    Snapshot, SnapshotSummary, TableIdent, TableMetadata, TableSchema,
};
pub use retention::{RetentionPolicy, RetentionSplit};
