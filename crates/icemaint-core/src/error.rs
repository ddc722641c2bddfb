//! Error types for the icemaint core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for icemaint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for icemaint.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Planning rejected the request (bad filter or sort key)
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    /// Catalog-related error
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Procedure dispatch error
    #[error("Procedure error: {0}")]
    Procedure(#[from] ProcedureError),

    /// Commit retries exhausted; metadata left at its last valid state
    #[error("Maintenance aborted after {attempts} commit attempts: {reason}")]
    MaintenanceAborted { attempts: u32, reason: String },

    /// Memory guard tripped while reading
    #[error("Memory limit exceeded: requested {requested} bytes with limit {limit} bytes")]
    MemoryLimitExceeded { requested: usize, limit: usize },

    /// File codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_transient(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Whether this is a compare-and-swap rejection from the catalog.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::Catalog(CatalogError::VersionConflict { .. }))
    }
}

/// Errors raised while building a maintenance plan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    /// Filter references a column that is not in the table schema
    #[error("Filter references unknown column '{0}'")]
    UnknownColumn(String),

    /// Sort key is not in the table schema
    #[error("Sort key '{0}' is not a column of the table")]
    UnknownSortKey(String),

    /// Sort compaction requested without keys
    #[error("Sort compaction requires at least one sort key")]
    EmptySortKeys,

    /// Filter text could not be parsed
    #[error("Invalid filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    /// Sort key text could not be parsed
    #[error("Invalid sort key '{0}'")]
    InvalidSortKey(String),

    /// Target size must be positive
    #[error("Target file size must be greater than zero")]
    InvalidTarget,
}

/// Catalog-specific errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// Snapshot not found
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(i64),

    /// Compare-and-set conflict
    #[error("Version conflict: expected version {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Proposed update violates a metadata invariant
    #[error("Invalid table update: {0}")]
    Validation(String),

    /// Generic catalog error
    #[error("Catalog error: {0}")]
    Other(String),
}

/// Classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Object does not exist
    NotFound,
    /// Create-only write found an existing object
    AlreadyExists,
    /// Timeout, throttling or connection failure; worth retrying
    Transient,
    /// Any other failure
    Permanent,
}

/// A failed storage call.
#[derive(Error, Debug, Clone)]
#[error("{kind:?} error for '{path}': {message}")]
pub struct StorageError {
    /// Failure classification
    pub kind: StorageErrorKind,
    /// Path the call targeted
    pub path: String,
    /// Underlying message
    pub message: String,
}

impl StorageError {
    /// Create a new storage error.
    pub fn new(kind: StorageErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the call may succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }

    /// Whether the target object is missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }
}

/// Procedure dispatch errors. Raised before any I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcedureError {
    /// Name is not in the procedure registry
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    /// Missing, unknown or mistyped parameter
    #[error("Invalid parameters for {procedure}: {message}")]
    InvalidParameters { procedure: String, message: String },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Error::Codec(err.to_string())
    }
}
