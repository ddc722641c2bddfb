//! Memory accounting for decoded batches.
//!
//! Every decoded batch held by an operation is backed by a
//! [`MemoryReservation`] on a shared [`MemoryGuard`]. Reservations release on
//! drop, so a batch that is written out and dropped frees its budget.

use crate::codec::{BatchIter, FileCodec};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Byte budget shared by the readers of one operation.
#[derive(Debug, Default)]
pub struct MemoryGuard {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MemoryGuard {
    /// Create a guard; `None` means unlimited.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// An unlimited guard that only tracks usage.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Reserve `bytes`, failing if the limit would be exceeded.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<MemoryReservation> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(Error::MemoryLimitExceeded {
                        requested: bytes,
                        limit,
                    });
                }
            }
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(MemoryReservation {
            guard: Arc::clone(self),
            bytes,
        })
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Configured limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Reserved bytes, released on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    guard: Arc<MemoryGuard>,
    bytes: usize,
}

impl MemoryReservation {
    /// Reserved size.
    pub fn size(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.guard.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A decoded batch and the memory it holds.
#[derive(Debug)]
pub struct GuardedBatch {
    /// The batch
    pub batch: RecordBatch,
    /// Reservation covering the batch
    pub reservation: MemoryReservation,
}

/// Reads one file batch by batch under a memory guard.
///
/// Tracks how many rows it has handed out; after a decode error,
/// [`ChunkedReader::restart`] resumes from that offset.
pub struct ChunkedReader {
    codec: Arc<dyn FileCodec>,
    guard: Arc<MemoryGuard>,
    bytes: Bytes,
    batch_rows: usize,
    position: usize,
    batches: Option<BatchIter>,
}

impl ChunkedReader {
    /// Create a reader over encoded file bytes.
    pub fn new(
        codec: Arc<dyn FileCodec>,
        guard: Arc<MemoryGuard>,
        bytes: Bytes,
        batch_rows: usize,
    ) -> Self {
        Self {
            codec,
            guard,
            bytes,
            batch_rows,
            position: 0,
            batches: None,
        }
    }

    /// Rows handed out so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Drop the decoder; the next call resumes at [`Self::position`].
    pub fn restart(&mut self) {
        debug!(offset_rows = self.position, "Restarting chunked read");
        self.batches = None;
    }

    /// Next batch, or `None` at end of file.
    pub fn next_batch(&mut self) -> Result<Option<GuardedBatch>> {
        if self.batches.is_none() {
            self.batches = Some(
                self.codec
                    .decode(self.bytes.clone(), self.position, self.batch_rows)?,
            );
        }

        let next = match self.batches.as_mut().and_then(Iterator::next) {
            Some(next) => next,
            None => return Ok(None),
        };

        let batch = match next {
            Ok(batch) => batch,
            Err(e) => {
                self.batches = None;
                return Err(e);
            }
        };

        let reservation = self.guard.reserve(batch.get_array_memory_size())?;
        self.position += batch.num_rows();

        Ok(Some(GuardedBatch { batch, reservation }))
    }
}

impl std::fmt::Debug for ChunkedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("batch_rows", &self.batch_rows)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
