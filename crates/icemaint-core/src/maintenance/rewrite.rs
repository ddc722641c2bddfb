//! Rewriting one group of files.
//!
//! Merge groups stream: batches flow from the inputs into an output buffer
//! that is flushed every `rows_per_output` rows, so at most one output's
//! worth of decoded rows is held at a time. Sort groups materialize the
//! whole group under the memory guard, sort it and split it again.

use super::planner::{RewriteGroup, SortKey, Transform};
use super::MaintenanceContext;
use crate::error::Error;
use crate::memory::{ChunkedReader, MemoryGuard, MemoryReservation};
use crate::metadata::{ColumnStats, FileReference, Literal, PartitionKey};
use crate::storage::join_path;
use crate::Result;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// A group whose outputs are written and waiting for the commit.
#[derive(Debug, Clone)]
pub struct CompletedGroup {
    /// The planned group
    pub group: RewriteGroup,
    /// Files written for it
    pub outputs: Vec<FileReference>,
}

impl CompletedGroup {
    /// Rows written.
    pub fn output_rows(&self) -> u64 {
        self.outputs.iter().map(|f| f.record_count).sum()
    }
}

/// Rows per output file so that outputs stay within `target_bytes`.
///
/// Estimated from the inputs' average bytes per row.
pub fn rows_per_output(group: &RewriteGroup, target_bytes: u64) -> usize {
    let bytes = group.input_bytes();
    let rows = group.input_rows();
    if bytes == 0 || rows == 0 {
        return usize::MAX;
    }
    let rows_per_target = (target_bytes as u128 * rows as u128) / bytes as u128;
    rows_per_target.clamp(1, usize::MAX as u128) as usize
}

/// Rewrite `group`, returning its written outputs.
///
/// On failure every output written so far is deleted before the error is
/// returned.
pub async fn rewrite_group(
    ctx: &MaintenanceContext,
    location: &str,
    group: &RewriteGroup,
    target_bytes: u64,
    guard: &Arc<MemoryGuard>,
) -> Result<CompletedGroup> {
    let mut writer = OutputWriter::new(
        ctx,
        location,
        &group.partition,
        rows_per_output(group, target_bytes),
    );

    let result = match &group.transform {
        Transform::Merge => merge_into(ctx, group, guard, &mut writer).await,
        Transform::Sort(keys) => sort_into(ctx, group, keys, guard, &mut writer).await,
    };

    match result {
        Ok(()) => {
            let outputs = writer.written.clone();
            debug!(
                partition = %group.partition,
                inputs = group.inputs.len(),
                outputs = outputs.len(),
                "Rewrote group"
            );
            Ok(CompletedGroup {
                group: group.clone(),
                outputs,
            })
        }
        Err(e) => {
            writer.discard().await;
            Err(e)
        }
    }
}

async fn read_input(ctx: &MaintenanceContext, path: &str) -> Result<Bytes> {
    ctx.executor
        .retry_policy()
        .retry("read", || ctx.storage.read(path))
        .await
}

/// Pull batches from one file, restarting the decoder once on a decode error.
fn next_batch(
    reader: &mut ChunkedReader,
    restarts: &mut u32,
    path: &str,
) -> Result<Option<(RecordBatch, MemoryReservation)>> {
    loop {
        match reader.next_batch() {
            Ok(Some(guarded)) => return Ok(Some((guarded.batch, guarded.reservation))),
            Ok(None) => return Ok(None),
            Err(Error::Codec(message)) if *restarts == 0 => {
                warn!(
                    path = %path,
                    offset_rows = reader.position(),
                    error = %message,
                    "Decode failed, restarting from offset"
                );
                *restarts += 1;
                reader.restart();
            }
            Err(e) => return Err(e),
        }
    }
}

async fn merge_into(
    ctx: &MaintenanceContext,
    group: &RewriteGroup,
    guard: &Arc<MemoryGuard>,
    writer: &mut OutputWriter<'_>,
) -> Result<()> {
    for input in &group.inputs {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes = read_input(ctx, &input.path).await?;
        let mut reader =
            ChunkedReader::new(ctx.codec.clone(), guard.clone(), bytes, ctx.read_batch_rows);
        let mut restarts = 0;

        while let Some((batch, reservation)) = next_batch(&mut reader, &mut restarts, &input.path)?
        {
            writer.push(batch, Some(reservation)).await?;
        }
    }

    writer.finish().await
}

async fn sort_into(
    ctx: &MaintenanceContext,
    group: &RewriteGroup,
    keys: &[SortKey],
    guard: &Arc<MemoryGuard>,
    writer: &mut OutputWriter<'_>,
) -> Result<()> {
    let mut batches = Vec::new();
    let mut reservations = Vec::new();

    for input in &group.inputs {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes = read_input(ctx, &input.path).await?;
        let mut reader =
            ChunkedReader::new(ctx.codec.clone(), guard.clone(), bytes, ctx.read_batch_rows);
        let mut restarts = 0;

        while let Some((batch, reservation)) = next_batch(&mut reader, &mut restarts, &input.path)?
        {
            batches.push(batch);
            reservations.push(reservation);
        }
    }

    let Some(first) = batches.first() else {
        return writer.finish().await;
    };
    let schema = first.schema();

    let merged = concat_batches(&schema, &batches)?;
    let merged_reservation = guard.reserve(merged.get_array_memory_size())?;
    drop(batches);
    drop(reservations);

    let sorted = sort_batch(&merged, keys)?;
    let sorted_reservation = guard.reserve(sorted.get_array_memory_size())?;
    drop(merged);
    drop(merged_reservation);

    writer.push(sorted, Some(sorted_reservation)).await?;
    writer.finish().await
}

/// Sort a batch by `keys`.
pub fn sort_batch(batch: &RecordBatch, keys: &[SortKey]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let sort_columns = keys
        .iter()
        .map(|key| {
            let index = schema.index_of(&key.column)?;
            Ok(SortColumn {
                values: batch.column(index).clone(),
                options: Some(SortOptions {
                    descending: key.descending,
                    nulls_first: key.nulls_first,
                }),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let indices = lexsort_to_indices(&sort_columns, None)?;
    let columns = batch
        .columns()
        .iter()
        .map(|column| take(column.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Buffers rows and writes them out in `rows_per_output` chunks.
struct OutputWriter<'a> {
    ctx: &'a MaintenanceContext,
    directory: String,
    partition: PartitionKey,
    rows_per_output: usize,
    schema: Option<SchemaRef>,
    pending: VecDeque<(RecordBatch, Option<MemoryReservation>)>,
    pending_rows: usize,
    written: Vec<FileReference>,
}

impl<'a> OutputWriter<'a> {
    fn new(
        ctx: &'a MaintenanceContext,
        location: &str,
        partition: &PartitionKey,
        rows_per_output: usize,
    ) -> Self {
        let data = join_path(location, "data");
        let directory = if partition.is_empty() {
            data
        } else {
            join_path(&data, &partition.to_path())
        };

        Self {
            ctx,
            directory,
            partition: partition.clone(),
            rows_per_output,
            schema: None,
            pending: VecDeque::new(),
            pending_rows: 0,
            written: Vec::new(),
        }
    }

    async fn push(
        &mut self,
        batch: RecordBatch,
        reservation: Option<MemoryReservation>,
    ) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if self.schema.is_none() {
            self.schema = Some(batch.schema());
        }

        self.pending_rows += batch.num_rows();
        self.pending.push_back((batch, reservation));

        while self.pending_rows >= self.rows_per_output {
            self.flush(self.rows_per_output).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.pending_rows > 0 {
            self.flush(self.pending_rows).await?;
        }
        Ok(())
    }

    /// Write the first `rows` pending rows as one file.
    async fn flush(&mut self, rows: usize) -> Result<()> {
        let mut batches = Vec::new();
        let mut released = Vec::new();
        let mut needed = rows;

        while needed > 0 {
            let Some((batch, reservation)) = self.pending.pop_front() else {
                break;
            };
            let available = batch.num_rows();
            if available <= needed {
                needed -= available;
                batches.push(batch);
                released.push(reservation);
            } else {
                batches.push(batch.slice(0, needed));
                self.pending
                    .push_front((batch.slice(needed, available - needed), reservation));
                needed = 0;
            }
        }
        self.pending_rows -= rows - needed;

        let Some(schema) = self.schema.clone() else {
            return Ok(());
        };

        let record_count: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let column_stats = collect_column_stats(&batches);
        let data = self.ctx.codec.encode(schema, &batches)?;
        drop(batches);
        drop(released);

        let path = join_path(
            &self.directory,
            &format!(
                "compacted-{}.{}",
                uuid::Uuid::new_v4(),
                self.ctx.codec.extension()
            ),
        );
        let size = data.len() as u64;

        self.ctx
            .executor
            .retry_policy()
            .retry("write", || self.ctx.storage.write(&path, data.clone()))
            .await?;

        debug!(path = %path, rows = record_count, size_bytes = size, "Wrote output file");

        let mut file =
            FileReference::new(path, self.partition.clone(), size, record_count as u64);
        file.column_stats = column_stats;
        self.written.push(file);
        Ok(())
    }

    /// Delete every file written so far.
    async fn discard(&mut self) {
        self.pending.clear();
        for file in self.written.drain(..) {
            if let Err(e) = self.ctx.storage.delete(&file.path).await {
                warn!(path = %file.path, error = %e, "Failed to delete partial output");
            }
        }
    }
}

/// Min/max/null statistics for columns of common scalar types.
fn collect_column_stats(batches: &[RecordBatch]) -> BTreeMap<String, ColumnStats> {
    let mut stats: BTreeMap<String, ColumnStats> = BTreeMap::new();

    for batch in batches {
        for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
            let Some((min, max)) = column_bounds(column.as_ref()) else {
                continue;
            };
            let entry = stats.entry(field.name().clone()).or_default();
            entry.null_count += column.null_count() as u64;
            entry.min = pick(entry.min.take(), min, std::cmp::Ordering::Less);
            entry.max = pick(entry.max.take(), max, std::cmp::Ordering::Greater);
        }
    }

    stats
}

fn pick(
    current: Option<Literal>,
    candidate: Option<Literal>,
    prefer: std::cmp::Ordering,
) -> Option<Literal> {
    match (current, candidate) {
        (Some(a), Some(b)) => {
            if b.partial_cmp_to(&a) == Some(prefer) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

type Bounds = (Option<Literal>, Option<Literal>);

fn column_bounds(column: &dyn Array) -> Option<Bounds> {
    use arrow::compute::{max, max_boolean, max_string, min, min_boolean, min_string};

    let any = column.as_any();
    let bounds = match column.data_type() {
        DataType::Int32 => {
            let a = any.downcast_ref::<Int32Array>()?;
            (
                min(a).map(|v| Literal::Int(v as i64)),
                max(a).map(|v| Literal::Int(v as i64)),
            )
        }
        DataType::Int64 => {
            let a = any.downcast_ref::<Int64Array>()?;
            (min(a).map(Literal::Int), max(a).map(Literal::Int))
        }
        DataType::Float32 => {
            let a = any.downcast_ref::<Float32Array>()?;
            (
                min(a).map(|v| Literal::Float(v as f64)),
                max(a).map(|v| Literal::Float(v as f64)),
            )
        }
        DataType::Float64 => {
            let a = any.downcast_ref::<Float64Array>()?;
            (min(a).map(Literal::Float), max(a).map(Literal::Float))
        }
        DataType::Utf8 => {
            let a = any.downcast_ref::<StringArray>()?;
            (
                min_string(a).map(|v| Literal::String(v.to_string())),
                max_string(a).map(|v| Literal::String(v.to_string())),
            )
        }
        DataType::Boolean => {
            let a = any.downcast_ref::<BooleanArray>()?;
            (min_boolean(a).map(Literal::Bool), max_boolean(a).map(Literal::Bool))
        }
        _ => return None,
    };
    Some(bounds)
}
