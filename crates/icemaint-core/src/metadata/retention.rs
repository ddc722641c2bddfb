//! Snapshot retention rules.

use super::model::{Snapshot, TableMetadata};
use crate::config::RetentionConfig;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

/// Which snapshots and files must survive maintenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Snapshots younger than this are retained
    pub max_snapshot_age: Duration,
    /// The most recent N snapshots are retained regardless of age
    pub min_snapshots_to_keep: usize,
    /// Unreferenced files younger than this are never deleted
    pub orphan_grace_period: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_snapshot_age: days(config.max_snapshot_age_days.into()).unwrap_or(Duration::MAX),
            min_snapshots_to_keep: config.min_snapshots_to_keep,
            orphan_grace_period: days(config.orphan_grace_period_days.into())
                .unwrap_or(Duration::MAX),
        }
    }
}

/// `count` days as a duration, or `None` when it does not fit.
pub fn days(count: u64) -> Option<Duration> {
    i64::try_from(count).ok().and_then(Duration::try_days)
}

/// Snapshot ids split into kept and expired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionSplit {
    /// Snapshots that stay in metadata, in history order
    pub retained: Vec<i64>,
    /// Snapshots that may be removed, in history order
    pub expired: Vec<i64>,
}

impl RetentionPolicy {
    /// Set the maximum snapshot age.
    pub fn with_max_snapshot_age(mut self, age: Duration) -> Self {
        self.max_snapshot_age = age;
        self
    }

    /// Set the minimum number of snapshots to keep.
    pub fn with_min_snapshots_to_keep(mut self, count: usize) -> Self {
        self.min_snapshots_to_keep = count;
        self
    }

    /// Set the orphan grace period.
    pub fn with_orphan_grace_period(mut self, grace: Duration) -> Self {
        self.orphan_grace_period = grace;
        self
    }

    /// Split the table history at `now`.
    ///
    /// Retained = the `min_snapshots_to_keep` most recent snapshots (by
    /// timestamp, then id) plus every snapshot younger than
    /// `max_snapshot_age` plus the current snapshot.
    pub fn split(&self, metadata: &TableMetadata, now: DateTime<Utc>) -> RetentionSplit {
        // No representable cutoff means every snapshot is young enough
        let cutoff = now.checked_sub_signed(self.max_snapshot_age);

        let mut newest_first: Vec<&Snapshot> = metadata.snapshots.iter().collect();
        newest_first.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.snapshot_id.cmp(&a.snapshot_id))
        });

        let mut keep: HashSet<i64> = newest_first
            .iter()
            .take(self.min_snapshots_to_keep)
            .map(|s| s.snapshot_id)
            .collect();

        keep.extend(
            metadata
                .snapshots
                .iter()
                .filter(|s| cutoff.map_or(true, |cutoff| s.timestamp > cutoff))
                .map(|s| s.snapshot_id),
        );

        if let Some(current) = metadata.current_snapshot_id {
            keep.insert(current);
        }

        let (retained, expired): (Vec<&Snapshot>, Vec<&Snapshot>) = metadata
            .snapshots
            .iter()
            .partition(|s| keep.contains(&s.snapshot_id));

        RetentionSplit {
            retained: retained.into_iter().map(|s| s.snapshot_id).collect(),
            expired: expired.into_iter().map(|s| s.snapshot_id).collect(),
        }
    }

    /// Whether a file last modified at `modified` is past the grace period.
    ///
    /// A negative grace period counts as zero; one reaching past the
    /// earliest representable time keeps every file.
    pub fn past_grace_period(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let grace = self.orphan_grace_period.max(Duration::zero());
        now.checked_sub_signed(grace)
            .is_some_and(|cutoff| modified < cutoff)
    }
}
