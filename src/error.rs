//! Error types for yellowcab using snafu.
//!
//! Each pipeline stage owns one error enum; `PipelineError` aggregates them and
//! remembers which stage failed so the run can be reported precisely.

use snafu::prelude::*;

use crate::pipeline::RunState;

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Source URL is empty.
    #[snafu(display("Source URL cannot be empty"))]
    EmptySourceUrl,

    /// Bucket is empty.
    #[snafu(display("Storage bucket cannot be empty"))]
    EmptyBucket,

    /// Object name is empty.
    #[snafu(display("Storage object name cannot be empty"))]
    EmptyObjectName,

    /// Raw and processed prefixes would write to the same key.
    #[snafu(display("Raw and processed prefixes must differ (both are '{prefix}')"))]
    SharedPrefix { prefix: String },

    /// A warehouse identifier is empty.
    #[snafu(display("Warehouse {field} cannot be empty"))]
    EmptyWarehouseField { field: &'static str },

    /// A count or duration that must be positive is zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroValue { field: &'static str },

    /// Relational sink enabled without a table name.
    #[snafu(display("Relational table cannot be empty when the sink is enabled"))]
    EmptyRelationalTable,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },
}

// ============ Fetch Errors ============

/// Errors raised while downloading the source file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    Client { source: reqwest::Error },

    /// The request never produced a response (DNS, connect, timeout, body read).
    #[snafu(display("Request to {url} failed after {attempts} attempt(s): {source}"))]
    Request {
        url: String,
        attempts: u32,
        source: reqwest::Error,
    },

    /// The remote answered with something other than 200 OK.
    #[snafu(display("Request to {url} returned HTTP {status} after {attempts} attempt(s)"))]
    Status {
        url: String,
        status: u16,
        attempts: u32,
    },

    /// Writing the response body to local disk failed.
    #[snafu(display("Failed to write {path}: {source}"))]
    Write {
        path: String,
        source: std::io::Error,
    },
}

// ============ Decode / Encode Errors ============

/// Errors raised while decoding a Parquet file into a table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// File does not exist.
    #[snafu(display("Columnar file not found: {path}"))]
    Missing { path: String },

    /// File exists but holds no bytes.
    #[snafu(display("Columnar file is empty: {path}"))]
    Empty { path: String },

    /// Failed to read the file.
    #[snafu(display("Failed to read {path}: {source}"))]
    ReadInput {
        path: String,
        source: std::io::Error,
    },

    /// Bytes are not a valid Parquet encoding.
    #[snafu(display("Invalid Parquet data in {path}: {source}"))]
    Parquet {
        path: String,
        source: parquet::errors::ParquetError,
    },

    /// Record batch decoding failed.
    #[snafu(display("Failed to decode record batch in {path}: {source}"))]
    Batch {
        path: String,
        source: arrow::error::ArrowError,
    },
}

/// Errors raised while encoding a table to Parquet.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EncodeError {
    /// Failed to create the Parquet writer.
    #[snafu(display("Failed to create Parquet writer: {source}"))]
    WriterCreate {
        source: parquet::errors::ParquetError,
    },

    /// Failed to write a batch or close the file.
    #[snafu(display("Failed to write Parquet: {source}"))]
    ParquetWrite {
        source: parquet::errors::ParquetError,
    },

    /// Failed to create, sync or rename the output file.
    #[snafu(display("Failed to write {path}: {source}"))]
    WriteOutput {
        path: String,
        source: std::io::Error,
    },
}

// ============ Schema Errors ============

/// Errors raised by the transformer when the input does not have the expected shape.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Fare column is absent.
    #[snafu(display("Column '{column}' not found in input schema"))]
    MissingColumn { column: String },

    /// Fare column exists but is not numeric.
    #[snafu(display("Column '{column}' has non-numeric type {data_type}"))]
    NonNumeric { column: String, data_type: String },

    /// A derived column would overwrite an existing column.
    #[snafu(display("Derived column '{column}' already exists in input schema"))]
    Conflict { column: String },

    /// Arrow compute or batch assembly failed.
    #[snafu(display("Failed to derive columns: {source}"))]
    Compute { source: arrow::error::ArrowError },
}

// ============ Upload Errors ============

/// Errors raised while publishing a local file to the object store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum UploadError {
    /// Local file could not be read.
    #[snafu(display("Failed to read local file {path}: {source}"))]
    ReadLocal {
        path: String,
        source: std::io::Error,
    },

    /// Object store rejected the write.
    #[snafu(display("Failed to upload {key}: {source}"))]
    Put { key: String, source: StorageError },
}

// ============ Load Job Errors ============

/// Errors raised by the warehouse loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadJobError {
    /// Failed to build the warehouse HTTP client.
    #[snafu(display("Failed to build warehouse HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },

    /// Submitting the job failed.
    #[snafu(display("Failed to submit load job for {uri}: {message}"))]
    Submit { uri: String, message: String },

    /// Polling the job state failed.
    #[snafu(display("Failed to poll load job {job_id}: {message}"))]
    Poll { job_id: String, message: String },

    /// The warehouse reported the job as failed.
    #[snafu(display("Load job {job_id} failed: {detail}"))]
    JobFailed { job_id: String, detail: String },

    /// The job did not reach a terminal state in time.
    #[snafu(display("Load job {job_id} did not finish within {secs}s"))]
    Timeout { job_id: String, secs: u64 },

    /// Reading a table back from the warehouse failed.
    #[snafu(display("Failed to read table {table}: {message}"))]
    ReadTable { table: String, message: String },

    /// The configured warehouse cannot honour the request.
    #[snafu(display("Unsupported load request: {message}"))]
    Unsupported { message: String },
}

// ============ Upsert Errors ============

/// Errors raised by the relational loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum UpsertError {
    /// Connecting to the database failed.
    #[snafu(display("Failed to connect to relational sink: {message}"))]
    Connect { message: String },

    /// DDL or transaction control failed.
    #[snafu(display("Failed to prepare table {table}: {message}"))]
    Prepare { table: String, message: String },

    /// A batch write failed. Rows already committed stay committed unless the
    /// upsert ran inside a single transaction.
    #[snafu(
        context(name(UpsertBatchSnafu)),
        display("Batch {batch} for {table} failed after {rows_committed} committed row(s): {message}")
    )]
    Batch {
        table: String,
        batch: usize,
        rows_committed: u64,
        message: String,
    },

    /// A column type has no relational mapping.
    #[snafu(display("Column '{column}' has unsupported type {data_type}"))]
    UnsupportedType { column: String, data_type: String },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors, one variant per failure kind.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage setup error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Download failed.
    #[snafu(display("Fetch failed: {source}"))]
    Fetch { source: FetchError },

    /// Local Parquet file missing or corrupt.
    #[snafu(display("Decode failed: {source}"))]
    Decode { source: DecodeError },

    /// Input did not have the expected columns.
    #[snafu(display("Transform failed: {source}"))]
    Schema { source: SchemaError },

    /// Writing the processed file failed.
    #[snafu(display("Encode failed: {source}"))]
    Encode { source: EncodeError },

    /// Publishing to the object store failed.
    #[snafu(display("Upload failed: {source}"))]
    Upload { source: UploadError },

    /// Warehouse load failed.
    #[snafu(display("Warehouse load failed: {source}"))]
    LoadJob { source: LoadJobError },

    /// Relational upsert failed.
    #[snafu(display("Relational upsert failed: {source}"))]
    Upsert { source: UpsertError },

    /// Metrics initialization failed.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Blocking task panicked or was cancelled.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The run was cancelled while a stage was in flight.
    #[snafu(display("Run cancelled during {stage}"))]
    Cancelled { stage: RunState },

    /// Another run holds the working directory.
    #[snafu(display("Working directory is locked by another run ({path})"))]
    RunLocked { path: String },

    /// Working directory could not be prepared.
    #[snafu(display("Failed to prepare working directory {path}: {source}"))]
    WorkingDir {
        path: String,
        source: std::io::Error,
    },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<FetchError> for PipelineError {
    fn from(source: FetchError) -> Self {
        PipelineError::Fetch { source }
    }
}

impl From<DecodeError> for PipelineError {
    fn from(source: DecodeError) -> Self {
        PipelineError::Decode { source }
    }
}

impl From<SchemaError> for PipelineError {
    fn from(source: SchemaError) -> Self {
        PipelineError::Schema { source }
    }
}

impl From<EncodeError> for PipelineError {
    fn from(source: EncodeError) -> Self {
        PipelineError::Encode { source }
    }
}

impl From<UploadError> for PipelineError {
    fn from(source: UploadError) -> Self {
        PipelineError::Upload { source }
    }
}

impl From<LoadJobError> for PipelineError {
    fn from(source: LoadJobError) -> Self {
        PipelineError::LoadJob { source }
    }
}

impl From<UpsertError> for PipelineError {
    fn from(source: UpsertError) -> Self {
        PipelineError::Upsert { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}

impl PipelineError {
    /// The stage this error belongs to, when the error kind alone says so.
    ///
    /// Upload errors come from either publish stage and setup errors from none;
    /// the run report records the exact stage for those.
    pub fn stage(&self) -> Option<RunState> {
        match self {
            PipelineError::Fetch { .. } => Some(RunState::Fetching),
            PipelineError::Decode { .. } => Some(RunState::Reading),
            PipelineError::Schema { .. } | PipelineError::Upsert { .. } => {
                Some(RunState::Transforming)
            }
            PipelineError::Encode { .. } => Some(RunState::Writing),
            PipelineError::LoadJob { .. } => Some(RunState::Loading),
            PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::RunLocked { .. } | PipelineError::WorkingDir { .. } => {
                Some(RunState::Pending)
            }
            PipelineError::Upload { .. }
            | PipelineError::Config { .. }
            | PipelineError::Storage { .. }
            | PipelineError::Metrics { .. }
            | PipelineError::TaskJoin { .. } => None,
        }
    }
}
