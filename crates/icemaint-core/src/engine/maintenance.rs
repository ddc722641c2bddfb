//! Main maintenance engine.
//!
//! Owns the catalog, storage, codec, configuration, metrics and the
//! cancellation token, and exposes the four maintenance operations:
//! - Compaction (bin-pack merge of small files)
//! - Sort compaction (merge and re-cluster by sort keys)
//! - Snapshot expiry
//! - Orphan file removal

use crate::codec::{FileCodec, ParquetCodec};
use crate::config::{Config, MAX_RETENTION_DAYS};
use crate::maintenance::{
    CompactOptions, CompactionResult, CompactionTask, ExpirationResult, ExpirationTask,
    ExpireOptions, MaintenanceContext, OrphanCleanupTask, OrphanOptions, OrphanResult,
};
use crate::metadata::retention;
use crate::metadata::{Catalog, FileCatalog, RetentionPolicy, TableIdent};
use crate::metrics::MaintenanceMetrics;
use crate::storage::{ObjectStoreStorage, Storage};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main maintenance engine.
#[derive(Debug, Clone)]
pub struct MaintenanceEngine {
    config: Config,
    ctx: MaintenanceContext,
}

impl MaintenanceEngine {
    /// Create an engine over explicit collaborators.
    ///
    /// Uses a [`ParquetCodec`] with the configured compression unless
    /// replaced with [`Self::with_codec`].
    pub fn new(config: Config, catalog: Arc<dyn Catalog>, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;

        let codec: Arc<dyn FileCodec> = Arc::new(ParquetCodec::new(config.compaction.compression));
        let ctx = MaintenanceContext::new(catalog, storage, codec, &config);

        Ok(Self { config, ctx })
    }

    /// Create an engine over the local warehouse named in the configuration.
    ///
    /// Tables live under `{warehouse_path}/{namespace}/{name}` and are
    /// tracked by a [`FileCatalog`].
    pub fn open_local(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.warehouse_path)?;
        let storage: Arc<dyn Storage> =
            Arc::new(ObjectStoreStorage::local(&config.storage.warehouse_path)?);
        let catalog: Arc<dyn Catalog> = Arc::new(FileCatalog::new(storage.clone(), ""));

        info!(
            warehouse = %config.storage.warehouse_path.display(),
            "Opened local warehouse"
        );

        Self::new(config, catalog, storage)
    }

    /// Replace the file codec.
    pub fn with_codec(mut self, codec: Arc<dyn FileCodec>) -> Self {
        self.ctx.codec = codec;
        self
    }

    /// Share a metrics sink with other components.
    pub fn with_metrics(mut self, metrics: Arc<MaintenanceMetrics>) -> Self {
        self.ctx = self.ctx.with_metrics(metrics);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.ctx = self.ctx.with_cancellation(cancel);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &MaintenanceMetrics {
        &self.ctx.metrics
    }

    /// Token that stops in-progress operations when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Get the catalog.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.ctx.catalog
    }

    /// Get the storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.ctx.storage
    }

    fn compaction_task(&self, ident: &TableIdent, options: CompactOptions) -> Result<CompactionTask> {
        let max_files = options
            .max_files_per_group
            .unwrap_or(self.config.compaction.max_files_per_group);
        if max_files == 0 {
            return Err(Error::Config(
                "max_files_per_group must be greater than 0".into(),
            ));
        }

        let target = options
            .target_file_size_bytes
            .unwrap_or_else(|| self.config.compaction.target_file_size_bytes());

        Ok(
            CompactionTask::new(self.ctx.clone(), ident.clone(), target, max_files)
                .with_filter(options.filter),
        )
    }

    /// Merge small files into files close to the target size.
    pub async fn compact(
        &self,
        ident: &TableIdent,
        options: CompactOptions,
    ) -> Result<CompactionResult> {
        self.compaction_task(ident, options)?.run().await
    }

    /// Merge small files and sort their rows by `sort_keys`.
    ///
    /// Each key is `column [ASC|DESC] [NULLS FIRST|NULLS LAST]`.
    pub async fn sort_compact(
        &self,
        ident: &TableIdent,
        sort_keys: Vec<String>,
        options: CompactOptions,
    ) -> Result<CompactionResult> {
        self.compaction_task(ident, options)?
            .with_sort_keys(sort_keys)
            .run()
            .await
    }

    /// Remove snapshots outside the retention policy and their unreachable files.
    pub async fn expire_snapshots(
        &self,
        ident: &TableIdent,
        options: ExpireOptions,
    ) -> Result<ExpirationResult> {
        let mut policy = RetentionPolicy::from(&self.config.retention);
        if let Some(days) = options.max_age_days {
            policy = policy.with_max_snapshot_age(retention_days("max_age_days", days)?);
        }
        if let Some(count) = options.min_retain {
            policy = policy.with_min_snapshots_to_keep(count);
        }

        ExpirationTask::new(self.ctx.clone(), ident.clone(), policy)
            .with_dry_run(options.dry_run)
            .run()
            .await
    }

    /// Delete unreferenced data files older than the grace period.
    pub async fn remove_orphan_files(
        &self,
        ident: &TableIdent,
        options: OrphanOptions,
    ) -> Result<OrphanResult> {
        let mut policy = RetentionPolicy::from(&self.config.retention);
        if let Some(days) = options.grace_days {
            policy = policy.with_orphan_grace_period(retention_days("grace_days", days)?);
        }

        OrphanCleanupTask::new(self.ctx.clone(), ident.clone(), policy)
            .with_dry_run(options.dry_run)
            .run()
            .await
    }
}

fn retention_days(name: &str, days: u64) -> Result<chrono::Duration> {
    if days > MAX_RETENTION_DAYS {
        return Err(Error::Config(format!(
            "{} must be at most {}, got {}",
            name, MAX_RETENTION_DAYS, days
        )));
    }
    retention::days(days)
        .ok_or_else(|| Error::Config(format!("{} = {} is out of range", name, days)))
}
