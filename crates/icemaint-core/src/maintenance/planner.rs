//! Compaction planning.
//!
//! Planning is pure: it looks at the live files of the current snapshot and
//! returns a [`RewritePlan`] without touching storage.
//!
//! ## Bin-packing
//!
//! 1. **Select**: keep files the filter may match
//! 2. **Partition**: group by partition key, in key order
//! 3. **Pack**: sort by size (ties by path) and greedily fill buckets while
//!    the total stays within the target and the count below the cap
//! 4. **Rebalance**: with n ≥ 2 buckets, prefer n even contiguous buckets
//!    when they still respect the target and the cap
//! 5. **Drop singletons**: a lone file has nothing to merge with

use super::filter::Filter;
use crate::error::PlanningError;
use crate::metadata::{FileReference, PartitionKey, TableSchema};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// One sort column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    /// Column name
    pub column: String,
    /// Descending order
    pub descending: bool,
    /// Nulls sort before values
    pub nulls_first: bool,
}

impl SortKey {
    /// Ascending key with nulls first.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
            nulls_first: true,
        }
    }

    /// Descending key with nulls last.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
            nulls_first: false,
        }
    }
}

impl FromStr for SortKey {
    type Err = PlanningError;

    /// Parse `column [ASC|DESC] [NULLS FIRST|NULLS LAST]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        let invalid = || PlanningError::InvalidSortKey(s.to_string());

        let (column, rest) = words.split_first().ok_or_else(invalid)?;
        let upper: Vec<String> = rest.iter().map(|w| w.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        let (descending, rest) = match upper.as_slice() {
            ["ASC", rest @ ..] => (false, rest),
            ["DESC", rest @ ..] => (true, rest),
            rest => (false, rest),
        };

        let nulls_first = match rest {
            [] => !descending,
            ["NULLS", "FIRST"] => true,
            ["NULLS", "LAST"] => false,
            _ => return Err(invalid()),
        };

        Ok(Self {
            column: column.to_string(),
            descending,
            nulls_first,
        })
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} NULLS {}",
            self.column,
            if self.descending { "DESC" } else { "ASC" },
            if self.nulls_first { "FIRST" } else { "LAST" }
        )
    }
}

/// What a group does to its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "keys", rename_all = "lowercase")]
pub enum Transform {
    /// Concatenate rows unchanged
    Merge,
    /// Sort rows by the keys
    Sort(Vec<SortKey>),
}

/// Files of one partition rewritten together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewriteGroup {
    /// Partition of every input
    pub partition: PartitionKey,
    /// Input files, smallest first
    pub inputs: Vec<FileReference>,
    /// Row transform
    pub transform: Transform,
    /// Expected number of output files
    pub estimated_outputs: usize,
}

impl RewriteGroup {
    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|f| f.file_size_bytes).sum()
    }

    /// Total input rows.
    pub fn input_rows(&self) -> u64 {
        self.inputs.iter().map(|f| f.record_count).sum()
    }

    /// Input paths.
    pub fn input_paths(&self) -> Vec<String> {
        self.inputs.iter().map(|f| f.path.clone()).collect()
    }
}

/// Groups to rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RewritePlan {
    /// Snapshot the plan was built from
    pub snapshot_id: Option<i64>,
    /// Target output size
    pub target_file_size_bytes: u64,
    /// Groups in partition order
    pub groups: Vec<RewriteGroup>,
}

impl RewritePlan {
    /// Whether there is nothing to rewrite.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Input files across all groups.
    pub fn input_file_count(&self) -> usize {
        self.groups.iter().map(|g| g.inputs.len()).sum()
    }
}

/// Paths to delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletePlan {
    /// Paths in deletion order
    pub paths: Vec<String>,
    /// Bytes held by the paths, when known
    pub total_bytes: u64,
}

impl DeletePlan {
    /// Whether there is nothing to delete.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Builds rewrite plans.
#[derive(Debug, Clone)]
pub struct CompactionPlanner {
    target_file_size_bytes: u64,
    max_files_per_group: usize,
    filter: Option<String>,
    sort_keys: Option<Vec<String>>,
}

impl CompactionPlanner {
    /// Create a planner.
    pub fn new(target_file_size_bytes: u64, max_files_per_group: usize) -> Self {
        Self {
            target_file_size_bytes,
            max_files_per_group,
            filter: None,
            sort_keys: None,
        }
    }

    /// Only consider files the filter may match.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Sort rewritten rows by these keys.
    pub fn with_sort_keys(mut self, sort_keys: Vec<String>) -> Self {
        self.sort_keys = Some(sort_keys);
        self
    }

    fn transform(&self, schema: &TableSchema) -> Result<Transform, PlanningError> {
        let Some(raw_keys) = &self.sort_keys else {
            return Ok(Transform::Merge);
        };

        if raw_keys.is_empty() {
            return Err(PlanningError::EmptySortKeys);
        }

        let keys = raw_keys
            .iter()
            .map(|raw| {
                let key: SortKey = raw.parse()?;
                if !schema.has_column(&key.column) {
                    return Err(PlanningError::UnknownSortKey(key.column));
                }
                Ok(key)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Transform::Sort(keys))
    }

    /// Plan rewrites for the live files of `snapshot_id`.
    pub fn plan(
        &self,
        schema: &TableSchema,
        snapshot_id: Option<i64>,
        files: &[FileReference],
    ) -> Result<RewritePlan, PlanningError> {
        if self.target_file_size_bytes == 0 {
            return Err(PlanningError::InvalidTarget);
        }

        let transform = self.transform(schema)?;

        let filter = match &self.filter {
            Some(text) => {
                let filter = Filter::parse(text)?;
                filter.validate(schema)?;
                Some(filter)
            }
            None => None,
        };

        let mut partitions: BTreeMap<&PartitionKey, Vec<&FileReference>> = BTreeMap::new();
        for file in files {
            if filter.as_ref().map_or(true, |f| f.may_match(file)) {
                partitions.entry(&file.partition).or_default().push(file);
            }
        }

        let mut groups = Vec::new();
        for (partition, mut partition_files) in partitions {
            partition_files.sort_by(|a, b| {
                a.file_size_bytes
                    .cmp(&b.file_size_bytes)
                    .then_with(|| a.path.cmp(&b.path))
            });

            let buckets = self.pack(&partition_files);
            debug!(
                partition = %partition,
                files = partition_files.len(),
                buckets = buckets.len(),
                "Packed partition"
            );

            for bucket in buckets.into_iter().filter(|b| b.len() >= 2) {
                let bytes: u64 = bucket.iter().map(|f| f.file_size_bytes).sum();
                let estimated_outputs =
                    (bytes.div_ceil(self.target_file_size_bytes) as usize).max(1);
                groups.push(RewriteGroup {
                    partition: partition.clone(),
                    inputs: bucket.into_iter().cloned().collect(),
                    transform: transform.clone(),
                    estimated_outputs,
                });
            }
        }

        Ok(RewritePlan {
            snapshot_id,
            target_file_size_bytes: self.target_file_size_bytes,
            groups,
        })
    }

    fn fits(&self, bucket: &[&FileReference]) -> bool {
        bucket.len() <= self.max_files_per_group
            && bucket.iter().map(|f| f.file_size_bytes).sum::<u64>() <= self.target_file_size_bytes
    }

    /// Greedy packing of size-sorted files, then an even rebalance.
    fn pack<'a>(&self, sorted: &[&'a FileReference]) -> Vec<Vec<&'a FileReference>> {
        let mut buckets: Vec<Vec<&'a FileReference>> = Vec::new();
        let mut current: Vec<&'a FileReference> = Vec::new();
        let mut current_size: u64 = 0;

        for file in sorted {
            let overflows = current_size + file.file_size_bytes > self.target_file_size_bytes
                || current.len() >= self.max_files_per_group;
            if overflows && !current.is_empty() {
                buckets.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(*file);
            current_size += file.file_size_bytes;
        }
        if !current.is_empty() {
            buckets.push(current);
        }

        let n = buckets.len();
        if n >= 2 {
            let chunk = sorted.len().div_ceil(n);
            let even: Vec<Vec<&'a FileReference>> =
                sorted.chunks(chunk).map(|c| c.to_vec()).collect();
            if even.len() == n && even.iter().all(|b| self.fits(b)) {
                return even;
            }
        }

        buckets
    }
}
