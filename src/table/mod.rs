//! In-memory tables and their Parquet encoding.
//!
//! A [`Table`] is an Arrow schema plus the record batches decoded from one
//! file. Decoding and encoding are synchronous; the pipeline runs them on the
//! blocking pool.

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::ChunkReader;
use snafu::prelude::*;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::ParquetCompression;
use crate::error::{
    BatchSnafu, DecodeError, EmptySnafu, EncodeError, MissingSnafu, ParquetSnafu,
    ParquetWriteSnafu, ReadInputSnafu, WriteOutputSnafu, WriterCreateSnafu,
};

/// Ordered, typed columns with a fixed row count.
#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    /// Batches must all carry `schema`.
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// All rows as a single batch.
    pub fn concat(&self) -> Result<RecordBatch, ArrowError> {
        concat_batches(&self.schema, &self.batches)
    }
}

/// Equal when schemas match and the rows match, regardless of batch boundaries.
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        if self.schema != other.schema || self.num_rows() != other.num_rows() {
            return false;
        }
        match (self.concat(), other.concat()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Decode the Parquet file at `path`.
pub fn read(path: &Path) -> Result<Table, DecodeError> {
    let display = path.display().to_string();

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return MissingSnafu { path: display }.fail();
        }
        Err(source) => return Err(DecodeError::ReadInput { path: display, source }),
    };
    ensure!(metadata.len() > 0, EmptySnafu { path: display });

    let file = File::open(path).context(ReadInputSnafu { path: &display })?;
    decode(file, &display)
}

/// Decode an in-memory Parquet payload; `origin` names it in errors.
pub fn decode_bytes(bytes: Bytes, origin: &str) -> Result<Table, DecodeError> {
    ensure!(!bytes.is_empty(), EmptySnafu { path: origin });
    decode(bytes, origin)
}

fn decode<R: ChunkReader + 'static>(input: R, origin: &str) -> Result<Table, DecodeError> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(input).context(ParquetSnafu { path: origin })?;
    let schema = builder.schema().clone();
    let reader = builder.build().context(ParquetSnafu { path: origin })?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(BatchSnafu { path: origin })?;

    Ok(Table::new(schema, batches))
}

/// Encode `table` to `path`, replacing any existing file.
///
/// The file is written next to the target as `<path>.tmp` and renamed into
/// place once the footer is flushed.
pub fn write(
    table: &Table,
    path: &Path,
    compression: ParquetCompression,
) -> Result<PathBuf, EncodeError> {
    let display = path.display().to_string();
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = File::create(&tmp).context(WriteOutputSnafu { path: &display })?;
    let file = encode_into(table, file, compression)?;
    file.sync_all().context(WriteOutputSnafu { path: &display })?;
    drop(file);

    fs::rename(&tmp, path).context(WriteOutputSnafu { path: display })?;
    Ok(path.to_path_buf())
}

/// Encode `table` into an in-memory Parquet payload.
pub fn encode(table: &Table, compression: ParquetCompression) -> Result<Bytes, EncodeError> {
    let buf = encode_into(table, Vec::new(), compression)?;
    Ok(Bytes::from(buf))
}

fn encode_into<W: Write + Send>(
    table: &Table,
    sink: W,
    compression: ParquetCompression,
) -> Result<W, EncodeError> {
    let props = writer_properties(compression);
    let mut writer = ArrowWriter::try_new(sink, table.schema.clone(), Some(props))
        .context(WriterCreateSnafu)?;
    for batch in &table.batches {
        writer.write(batch).context(ParquetWriteSnafu)?;
    }
    writer.into_inner().context(ParquetWriteSnafu)
}

pub(crate) fn writer_properties(compression: ParquetCompression) -> WriterProperties {
    let codec = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };
    WriterProperties::builder().set_compression(codec).build()
}
