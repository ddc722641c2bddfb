//! Maintenance operations on snapshot-versioned tables.
//!
//! - **Compaction**: merge small files of a partition into target-sized ones
//! - **Sort compaction**: the same, re-clustering rows by a key sequence
//! - **Expiration**: remove snapshots outside the retention policy
//! - **Orphan cleanup**: delete unreferenced files past a grace period
//!
//! Every task loads fresh metadata, builds a plan, performs the file work
//! through the [`IoExecutor`] and commits with optimistic concurrency.

mod commit;
mod compaction;
mod expiration;
mod filter;
mod orphan;
mod planner;
mod rewrite;
mod stats;

pub use commit::{CommitReport, RewriteCommitter};
pub use compaction::{CompactOptions, CompactionTask};
pub use expiration::{ExpirationPlan, ExpirationTask, ExpireOptions};
pub use filter::{CompareOp, Filter, Term};
pub use orphan::{OrphanCleanupTask, OrphanOptions, DEFAULT_PATH_LIMIT};
pub use planner::{
    CompactionPlanner, DeletePlan, RewriteGroup, RewritePlan, SortKey, Transform,
};
pub use rewrite::{rewrite_group, rows_per_output, sort_batch, CompletedGroup};
pub use stats::{CompactionResult, ExpirationResult, OrphanResult, Stats};

use crate::codec::FileCodec;
use crate::config::Config;
use crate::executor::{IoExecutor, RetryPolicy};
use crate::metadata::Catalog;
use crate::metrics::MaintenanceMetrics;
use crate::storage::Storage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Collaborators and settings shared by the maintenance tasks.
#[derive(Debug, Clone)]
pub struct MaintenanceContext {
    /// Table metadata
    pub catalog: Arc<dyn Catalog>,
    /// Data files
    pub storage: Arc<dyn Storage>,
    /// Column file format
    pub codec: Arc<dyn FileCodec>,
    /// File-level worker pool
    pub executor: IoExecutor,
    /// Backoff between commit attempts
    pub commit_retry: RetryPolicy,
    /// Counters
    pub metrics: Arc<MaintenanceMetrics>,
    /// Stops new work when fired
    pub cancel: CancellationToken,
    /// Byte budget for decoded batches of one operation
    pub memory_limit: Option<usize>,
    /// Rows per decoded batch
    pub read_batch_rows: usize,
    /// Deletes handed to the executor at a time
    pub delete_chunk_size: usize,
}

impl MaintenanceContext {
    /// Build a context from configuration.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn FileCodec>,
        config: &Config,
    ) -> Self {
        let metrics = Arc::new(MaintenanceMetrics::new());
        let cancel = CancellationToken::new();
        let executor = IoExecutor::new(config.io.max_workers, config.io_retry())
            .with_cancellation(cancel.clone())
            .with_metrics(metrics.clone());

        Self {
            catalog,
            storage,
            codec,
            executor,
            commit_retry: config.commit_retry(),
            metrics,
            cancel,
            memory_limit: config.memory.max_memory_bytes(),
            read_batch_rows: config.memory.read_batch_rows.max(1),
            delete_chunk_size: config.io.delete_chunk_size.max(1),
        }
    }

    /// Replace the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<MaintenanceMetrics>) -> Self {
        self.executor = self.executor.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Executor for deleting outputs of an abandoned rewrite.
    ///
    /// Not tied to the cancellation token, so cleanup still runs after
    /// cancellation.
    pub(crate) fn cleanup_executor(&self) -> IoExecutor {
        IoExecutor::new(
            self.executor.max_workers(),
            self.executor.retry_policy().clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }
}
