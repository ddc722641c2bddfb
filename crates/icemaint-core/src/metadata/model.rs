//! Table, snapshot and file reference types.

use crate::error::{Error, ProcedureError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Table identity: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdent {
    /// Namespace (database), may itself contain dots
    pub namespace: String,
    /// Table name
    pub name: String,
}

impl TableIdent {
    /// Create a new table identifier.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl FromStr for TableIdent {
    type Err = Error;

    /// Parse `"namespace.name"`; the last dot separates the name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ProcedureError::InvalidParameters {
                procedure: "table".into(),
                message: format!("'{}' is not a qualified table name (expected namespace.name)", s),
            }
            .into()),
        }
    }
}

/// What produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// New files added
    Append,
    /// Files replaced with new data
    Overwrite,
    /// Files removed
    Delete,
    /// Files rewritten without changing table content
    Replace,
}

impl Operation {
    /// Summary label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Append => "append",
            Operation::Overwrite => "overwrite",
            Operation::Delete => "delete",
            Operation::Replace => "replace",
        }
    }
}

/// Counters recorded when a snapshot is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Files added relative to the parent
    pub added_files: u64,
    /// Files removed relative to the parent
    pub removed_files: u64,
    /// Rows added relative to the parent
    pub added_rows: u64,
    /// Rows removed relative to the parent
    pub removed_rows: u64,
    /// Data files in the snapshot
    pub total_files: u64,
    /// Rows in the snapshot
    pub total_rows: u64,
}

/// Immutable, versioned view of a table's file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot ID (monotonic within a table)
    pub snapshot_id: i64,
    /// Parent snapshot ID (if any)
    pub parent_id: Option<i64>,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Operation kind
    pub operation: Operation,
    /// Key of the manifest holding this snapshot's file references
    pub manifest_list: String,
    /// Summary statistics
    pub summary: SnapshotSummary,
    /// Free-form properties supplied by the committer
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Column type as recorded in the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Date,
    Timestamp,
}

/// A schema column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Column name
    pub name: String,
    /// Column type
    pub field_type: FieldType,
    /// Whether nulls are allowed
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl SchemaField {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// Table schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema ID
    pub schema_id: i32,
    /// Ordered columns
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    /// Create a schema from its columns.
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self {
            schema_id: 0,
            fields,
        }
    }

    /// Look up a column by name.
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether the column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// A scalar used for statistics and filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Literal {
    /// Order two literals when their types are comparable.
    ///
    /// Integers and floats compare numerically; mixed other types do not compare.
    pub fn partial_cmp_to(&self, other: &Literal) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Literal::Bool(a), Literal::Bool(b)) => a.partial_cmp(b),
            (Literal::Int(a), Literal::Int(b)) => a.partial_cmp(b),
            (Literal::Float(a), Literal::Float(b)) => a.partial_cmp(b),
            (Literal::Int(a), Literal::Float(b)) => (*a as f64).partial_cmp(b),
            (Literal::Float(a), Literal::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Literal::String(a), Literal::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Interpret a partition value string with the type of `like`.
    pub fn coerce_like(raw: &str, like: &Literal) -> Literal {
        match like {
            Literal::Bool(_) => raw
                .parse()
                .map(Literal::Bool)
                .unwrap_or_else(|_| Literal::String(raw.to_string())),
            Literal::Int(_) => raw
                .parse()
                .map(Literal::Int)
                .unwrap_or_else(|_| Literal::String(raw.to_string())),
            Literal::Float(_) => raw
                .parse()
                .map(Literal::Float)
                .unwrap_or_else(|_| Literal::String(raw.to_string())),
            Literal::String(_) => Literal::String(raw.to_string()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{}", v),
            Literal::Int(v) => write!(f, "{}", v),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::String(v) => write!(f, "'{}'", v),
        }
    }
}

/// Per-column content statistics of a data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    /// Minimum non-null value
    pub min: Option<Literal>,
    /// Maximum non-null value
    pub max: Option<Literal>,
    /// Null values in the column
    #[serde(default)]
    pub null_count: u64,
}

/// Partition tuple of a data file, ordered by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub BTreeMap<String, String>);

impl PartitionKey {
    /// The unpartitioned key.
    pub fn unpartitioned() -> Self {
        Self::default()
    }

    /// Build a key from `(column, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Value of a partition column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    /// Whether this is the unpartitioned key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hive-style relative directory, e.g. `region=eu/day=3`.
    pub fn to_path(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<unpartitioned>")
        } else {
            write!(f, "{}", self.to_path())
        }
    }
}

/// A data file as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    /// Storage key of the file
    pub path: String,
    /// Partition tuple
    #[serde(default)]
    pub partition: PartitionKey,
    /// File size in bytes
    pub file_size_bytes: u64,
    /// Number of rows
    pub record_count: u64,
    /// Optional per-column statistics used for planning
    #[serde(default)]
    pub column_stats: BTreeMap<String, ColumnStats>,
}

impl FileReference {
    /// Create a reference without statistics.
    pub fn new(
        path: impl Into<String>,
        partition: PartitionKey,
        file_size_bytes: u64,
        record_count: u64,
    ) -> Self {
        Self {
            path: path.into(),
            partition,
            file_size_bytes,
            record_count,
            column_stats: BTreeMap::new(),
        }
    }

    /// Attach statistics for a column.
    pub fn with_column_stats(mut self, column: impl Into<String>, stats: ColumnStats) -> Self {
        self.column_stats.insert(column.into(), stats);
        self
    }
}

/// Cached view of a table's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Table identity
    pub ident: TableIdent,
    /// Metadata version, the compare-and-swap token
    pub version: u64,
    /// Storage location (key prefix)
    pub location: String,
    /// Table schema
    pub schema: TableSchema,
    /// Current snapshot (if any)
    pub current_snapshot_id: Option<i64>,
    /// Snapshot history, oldest first
    pub snapshots: Vec<Snapshot>,
    /// Highest snapshot id ever assigned, including expired ones
    #[serde(default)]
    pub last_snapshot_id: i64,
}

impl TableMetadata {
    /// The current snapshot.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id))
    }

    /// Look up a snapshot by id.
    pub fn snapshot(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Prefix under which data files live.
    pub fn data_location(&self) -> String {
        crate::storage::join_path(&self.location, "data")
    }

    /// Prefix under which catalog metadata lives.
    pub fn metadata_location(&self) -> String {
        crate::storage::join_path(&self.location, "metadata")
    }
}
