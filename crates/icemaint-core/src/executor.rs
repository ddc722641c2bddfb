//! Bounded parallel I/O with per-item retry.
//!
//! ## Retry
//!
//! Transient failures (see [`Error::is_transient`]) are retried with
//! exponential backoff: `min(max_delay, base_delay * 2^(attempt - 1))`,
//! with ±25% jitter unless disabled. Any other error fails the item at once.
//!
//! ## Batches
//!
//! [`IoExecutor::run_batch`] runs at most `max_workers` items at a time and
//! never fails as a whole: each item ends up succeeded, failed or
//! cancelled in the returned [`BatchReport`].

use crate::error::Error;
use crate::metrics::MaintenanceMetrics;
use crate::storage::Storage;
use crate::Result;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Whether to add ±25% jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with jitter enabled.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << retry.saturating_sub(1).min(20));
        let capped_ms = delay_ms.min(max_ms);

        let final_ms = if self.jitter && capped_ms > 0 {
            let jitter_range = capped_ms / 4;
            let jitter = rand::thread_rng().gen_range(0..=jitter_range * 2);
            capped_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }

    /// Run `op`, retrying transient failures.
    pub async fn retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_counted(operation, op).await.0
    }

    /// Like [`Self::retry`], also returning the number of attempts made.
    pub async fn retry_counted<T, F, Fut>(&self, operation: &str, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if e.is_transient() && attempts <= self.max_retries => {
                    let delay = self.backoff(attempts);
                    debug!(
                        operation = operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }
}

/// An item whose operation failed after retries.
#[derive(Debug)]
pub struct FailedItem<T> {
    /// The item
    pub item: T,
    /// Last error
    pub error: Error,
    /// Attempts made
    pub attempts: u32,
}

/// Outcome of a batch.
#[derive(Debug)]
pub struct BatchReport<T, R> {
    /// Items that succeeded, with their results
    pub succeeded: Vec<(T, R)>,
    /// Items that failed
    pub failed: Vec<FailedItem<T>>,
    /// Items never started because the batch was cancelled
    pub cancelled: Vec<T>,
}

impl<T, R> Default for BatchReport<T, R> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl<T, R> BatchReport<T, R> {
    /// Whether every item succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Merge another report into this one.
    pub fn extend(&mut self, other: BatchReport<T, R>) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.cancelled.extend(other.cancelled);
    }
}

enum ItemOutcome<R> {
    Succeeded(R),
    Failed(Error, u32),
    Cancelled,
}

/// Fixed-size worker pool for file operations.
#[derive(Debug, Clone)]
pub struct IoExecutor {
    max_workers: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    metrics: Option<Arc<MaintenanceMetrics>>,
}

impl IoExecutor {
    /// Create an executor with `max_workers` concurrent items.
    pub fn new(max_workers: usize, retry: RetryPolicy) -> Self {
        Self {
            max_workers: max_workers.max(1),
            retry,
            cancel: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Stop starting new items once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record retries and deletes.
    pub fn with_metrics(mut self, metrics: Arc<MaintenanceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry policy applied per item.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Maximum concurrent items.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `op` over `items` with bounded concurrency.
    ///
    /// Items not yet started when the cancellation token fires are reported
    /// as cancelled; in-flight items run to completion.
    pub async fn run_batch<T, R, F, Fut>(&self, items: Vec<T>, op: F) -> BatchReport<T, R>
    where
        T: Clone + Send,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let op = &op;
        let outcomes: Vec<(T, ItemOutcome<R>)> = stream::iter(items)
            .map(move |item| async move {
                if self.cancel.is_cancelled() {
                    return (item, ItemOutcome::Cancelled);
                }

                let (result, attempts) = self
                    .retry
                    .retry_counted("file operation", || op(item.clone()))
                    .await;

                if attempts > 1 {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_io_retries(u64::from(attempts - 1));
                    }
                }

                match result {
                    Ok(value) => (item, ItemOutcome::Succeeded(value)),
                    Err(e) => (item, ItemOutcome::Failed(e, attempts)),
                }
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (item, outcome) in outcomes {
            match outcome {
                ItemOutcome::Succeeded(value) => report.succeeded.push((item, value)),
                ItemOutcome::Failed(error, attempts) => report.failed.push(FailedItem {
                    item,
                    error,
                    attempts,
                }),
                ItemOutcome::Cancelled => report.cancelled.push(item),
            }
        }

        if !report.cancelled.is_empty() {
            warn!(
                cancelled = report.cancelled.len(),
                "Batch cancelled before all items started"
            );
        }

        report
    }

    /// Delete `paths`; a path that is already gone counts as deleted.
    pub async fn delete_files(
        &self,
        storage: &Arc<dyn Storage>,
        paths: Vec<String>,
    ) -> BatchReport<String, ()> {
        let report = self
            .run_batch(paths, |path| {
                let storage = Arc::clone(storage);
                async move {
                    match storage.delete(&path).await {
                        Err(Error::Storage(e)) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                }
            })
            .await;

        for failed in &report.failed {
            warn!(
                path = %failed.item,
                attempts = failed.attempts,
                error = %failed.error,
                "Failed to delete file, continuing"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_files_deleted(report.succeeded.len() as u64);
            metrics.record_delete_failures(report.failed.len() as u64);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StorageError, StorageErrorKind};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
            .without_jitter()
    }

    fn transient(path: &str) -> Error {
        StorageError::new(StorageErrorKind::Transient, path, "throttled").into()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500))
                .without_jitter();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_range() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5));
        for _ in 0..100 {
            let delay = policy.backoff(1).as_millis();
            assert!((75..=125).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = &AtomicU32::new(0);
        let (result, attempts) = fast_policy(3)
            .retry_counted("read", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient("a"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast_policy(2)
            .retry("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient("a"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast_policy(5)
            .retry("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Codec("corrupt footer".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_collects_partial_failures() {
        let executor = IoExecutor::new(4, fast_policy(1));
        let report = executor
            .run_batch((0..10).collect(), |i: u32| async move {
                if i % 3 == 0 {
                    Err(Error::Codec(format!("bad {}", i)))
                } else {
                    Ok(i * 2)
                }
            })
            .await;

        assert_eq!(report.succeeded.len(), 6);
        assert_eq!(report.failed.len(), 4);
        assert!(report.failed.iter().all(|f| f.attempts == 1));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_batch_respects_worker_limit() {
        let executor = IoExecutor::new(3, fast_policy(0));
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        let report = executor
            .run_batch((0..20).collect(), move |_: u32| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(report.succeeded.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancelled_batch_starts_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = IoExecutor::new(2, fast_policy(0)).with_cancellation(cancel);

        let report = executor
            .run_batch(vec!["a", "b", "c"], |_| async { Ok(()) })
            .await;

        assert!(report.succeeded.is_empty());
        assert_eq!(report.cancelled.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_success() {
        let storage: Arc<dyn Storage> = Arc::new(crate::storage::ObjectStoreStorage::in_memory());
        storage
            .write("t/data/a.parquet", bytes::Bytes::from_static(b"x"))
            .await
            .unwrap();

        let metrics = Arc::new(MaintenanceMetrics::new());
        let executor = IoExecutor::new(2, fast_policy(0)).with_metrics(metrics.clone());
        let report = executor
            .delete_files(
                &storage,
                vec!["t/data/a.parquet".into(), "t/data/missing.parquet".into()],
            )
            .await;

        assert_eq!(report.succeeded.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(metrics.files_deleted_total(), 2);
    }
}
