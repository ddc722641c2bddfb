//! Column file codec.
//!
//! Decoding is lazy and restartable: a reader that fails part way can resume
//! from the last row offset it handed out instead of re-reading the file.

use crate::config::ParquetCompression;
use crate::Result;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

/// Lazily decoded batches of one file.
pub struct BatchIter {
    schema: SchemaRef,
    inner: Box<dyn Iterator<Item = Result<RecordBatch>> + Send>,
}

impl BatchIter {
    /// Wrap a batch iterator.
    pub fn new(
        schema: SchemaRef,
        inner: Box<dyn Iterator<Item = Result<RecordBatch>> + Send>,
    ) -> Self {
        Self { schema, inner }
    }

    /// Schema of the decoded batches.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Iterator for BatchIter {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for BatchIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchIter")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Encodes and decodes data files.
pub trait FileCodec: Send + Sync + std::fmt::Debug {
    /// Decode `bytes` starting at row `offset_rows`, yielding batches of at
    /// most `batch_rows` rows.
    fn decode(&self, bytes: Bytes, offset_rows: usize, batch_rows: usize) -> Result<BatchIter>;

    /// Encode `batches` into one file.
    fn encode(&self, schema: SchemaRef, batches: &[RecordBatch]) -> Result<Bytes>;

    /// File extension of encoded files, without the dot.
    fn extension(&self) -> &'static str;
}

/// Parquet codec over `arrow`.
#[derive(Debug, Clone, Default)]
pub struct ParquetCodec {
    compression: ParquetCompression,
}

impl ParquetCodec {
    /// Create a codec writing with `compression`.
    pub fn new(compression: ParquetCompression) -> Self {
        Self { compression }
    }

    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
            ParquetCompression::Gzip => Compression::GZIP(Default::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };

        WriterProperties::builder()
            .set_compression(compression)
            .build()
    }
}

impl FileCodec for ParquetCodec {
    fn decode(&self, bytes: Bytes, offset_rows: usize, batch_rows: usize) -> Result<BatchIter> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let schema = builder.schema().clone();
        let reader = builder
            .with_offset(offset_rows)
            .with_batch_size(batch_rows.max(1))
            .build()?;

        Ok(BatchIter::new(
            schema,
            Box::new(reader.map(|batch| batch.map_err(Into::into))),
        ))
    }

    fn encode(&self, schema: SchemaRef, batches: &[RecordBatch]) -> Result<Bytes> {
        let mut buffer = Vec::new();
        {
            let mut writer =
                ArrowWriter::try_new(&mut buffer, schema, Some(self.writer_properties()))?;
            for batch in batches {
                writer.write(batch)?;
            }
            writer.close()?;
        }
        Ok(Bytes::from(buffer))
    }

    fn extension(&self) -> &'static str {
        "parquet"
    }
}
