//! Configuration parsing and validation.
//!
//! Every field has a default, and `Config::default()` reproduces the reference
//! run: the January 2021 yellow taxi file, published to the
//! `data-pipeline-parquet-teak-gamma-442315-f8` bucket and loaded into
//! `teak-gamma-442315-f8.data_pipeline.yellow_taxi_trips`. A YAML file only
//! needs to name what it changes.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyBucketSnafu, EmptyObjectNameSnafu, EmptyRelationalTableSnafu,
    EmptySourceUrlSnafu, EmptyWarehouseFieldSnafu, EnvInterpolationSnafu, ReadFileSnafu,
    SharedPrefixSnafu, YamlParseSnafu, ZeroValueSnafu,
};

/// Main configuration structure for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub parquet: ParquetConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
    /// Directory holding the downloaded and processed files plus the run lock.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            storage: StorageConfig::default(),
            transform: TransformConfig::default(),
            parquet: ParquetConfig::default(),
            warehouse: WarehouseConfig::default(),
            relational: RelationalConfig::default(),
            working_dir: default_working_dir(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

/// What to do when the source download fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFetchFailure {
    /// Fail the run.
    #[default]
    Abort,
    /// Continue with the file left by a previous run, if there is one.
    ReuseExisting,
}

/// Remote source of the trip file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub url: String,
    /// Whole-request timeout, including the body (default: 300).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after the first one (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts (default: 500).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub on_fetch_failure: OnFetchFailure,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            on_fetch_failure: OnFetchFailure::default(),
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_source_url() -> String {
    "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_2021-01.parquet".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Object storage target for the raw and processed copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket URL: `gs://name`, `s3://name`, `file:///dir` or an absolute path.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,
    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,
    /// Leaf name shared by both copies.
    #[serde(default = "default_object_name")]
    pub object_name: String,
    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            raw_prefix: default_raw_prefix(),
            processed_prefix: default_processed_prefix(),
            object_name: default_object_name(),
            storage_options: HashMap::new(),
        }
    }
}

impl StorageConfig {
    /// Object key of the raw copy.
    pub fn raw_key(&self) -> String {
        join_key(&self.raw_prefix, &self.object_name)
    }

    /// Object key of the processed copy.
    pub fn processed_key(&self) -> String {
        join_key(&self.processed_prefix, &self.object_name)
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn default_bucket() -> String {
    "gs://data-pipeline-parquet-teak-gamma-442315-f8".to_string()
}

fn default_raw_prefix() -> String {
    "raw_data".to_string()
}

fn default_processed_prefix() -> String {
    "processed".to_string()
}

fn default_object_name() -> String {
    "yellow_taxi_data.parquet".to_string()
}

/// Column names used by the transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_fare_column")]
    pub fare_column: String,
    #[serde(default = "default_squared_column")]
    pub squared_column: String,
    #[serde(default = "default_load_timestamp_column")]
    pub load_timestamp_column: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            fare_column: default_fare_column(),
            squared_column: default_squared_column(),
            load_timestamp_column: default_load_timestamp_column(),
        }
    }
}

fn default_fare_column() -> String {
    "total_amount".to_string()
}

fn default_squared_column() -> String {
    "total_squared".to_string()
}

fn default_load_timestamp_column() -> String {
    "load_timestamp".to_string()
}

/// Settings for the processed Parquet file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParquetConfig {
    #[serde(default)]
    pub compression: ParquetCompression,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

/// How a load treats rows already in the destination table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Swap the whole table for the loaded rows.
    #[default]
    Replace,
    /// Add the loaded rows to the existing ones.
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Replace => "replace",
            WriteMode::Append => "append",
        }
    }
}

/// Warehouse destination and load job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub mode: WriteMode,
    /// Delay between job state polls (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on the wait for a terminal job state (default: 3600).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub backend: WarehouseBackend,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            table: default_table(),
            mode: WriteMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            backend: WarehouseBackend::default(),
        }
    }
}

impl WarehouseConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn default_dataset() -> String {
    "data_pipeline".to_string()
}

fn default_table() -> String {
    "yellow_taxi_trips".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    3600
}

/// Which warehouse receives the load job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WarehouseBackend {
    #[serde(rename = "bigquery")]
    BigQuery(BigQueryConfig),
    /// Directory of Parquet tables, one file per table.
    Local(LocalWarehouseConfig),
}

impl Default for WarehouseBackend {
    fn default() -> Self {
        WarehouseBackend::BigQuery(BigQueryConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    #[serde(default = "default_project")]
    pub project: String,
    /// OAuth2 bearer token; usually `${GOOGLE_OAUTH_ACCESS_TOKEN}`.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: String,
    /// Per-request timeout for `jobs.insert` and `jobs.get`.
    #[serde(default = "default_bigquery_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BigQueryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            access_token: None,
            location: None,
            endpoint: default_bigquery_endpoint(),
            request_timeout_secs: default_bigquery_request_timeout_secs(),
        }
    }
}

fn default_project() -> String {
    "teak-gamma-442315-f8".to_string()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_bigquery_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalWarehouseConfig {
    pub path: PathBuf,
}

/// Optional relational sink. Connection fields left unset fall back to the
/// `DB_*` and `CLOUDSQL_CONNECTION_NAME` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Fail the run when the upsert fails (default: false).
    #[serde(default)]
    pub required: bool,
    /// Run the whole upsert inside one transaction (default: false).
    #[serde(default)]
    pub transactional: bool,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Cloud SQL instance connection name (`project:region:instance`).
    #[serde(default)]
    pub instance_connection_name: Option<String>,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            transactional: false,
            table: default_table(),
            mode: WriteMode::default(),
            batch_size: default_batch_size(),
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            instance_connection_name: None,
        }
    }
}

fn default_batch_size() -> usize {
    2000
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` while the run is in progress (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = vars::interpolate(content);
            if !result.is_ok() {
                return EnvInterpolationSnafu {
                    message: result.errors.join("\n"),
                }
                .fail();
            }
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.url.trim().is_empty(), EmptySourceUrlSnafu);
        ensure!(
            self.source.timeout_secs > 0,
            ZeroValueSnafu {
                field: "source.timeout_secs"
            }
        );

        ensure!(!self.storage.bucket.trim().is_empty(), EmptyBucketSnafu);
        ensure!(
            !self.storage.object_name.trim().is_empty(),
            EmptyObjectNameSnafu
        );
        ensure!(
            self.storage.raw_key() != self.storage.processed_key(),
            SharedPrefixSnafu {
                prefix: self.storage.raw_prefix.clone()
            }
        );

        ensure!(
            !self.warehouse.dataset.trim().is_empty(),
            EmptyWarehouseFieldSnafu { field: "dataset" }
        );
        ensure!(
            !self.warehouse.table.trim().is_empty(),
            EmptyWarehouseFieldSnafu { field: "table" }
        );
        ensure!(
            self.warehouse.poll_interval_ms > 0,
            ZeroValueSnafu {
                field: "warehouse.poll_interval_ms"
            }
        );
        ensure!(
            self.warehouse.job_timeout_secs > 0,
            ZeroValueSnafu {
                field: "warehouse.job_timeout_secs"
            }
        );
        if let WarehouseBackend::BigQuery(bq) = &self.warehouse.backend {
            ensure!(
                !bq.project.trim().is_empty(),
                EmptyWarehouseFieldSnafu { field: "project" }
            );
            ensure!(
                bq.request_timeout_secs > 0,
                ZeroValueSnafu {
                    field: "warehouse.bigquery.request_timeout_secs"
                }
            );
        }

        if self.relational.enabled {
            ensure!(
                !self.relational.table.trim().is_empty(),
                EmptyRelationalTableSnafu
            );
            ensure!(
                self.relational.batch_size > 0,
                ZeroValueSnafu {
                    field: "relational.batch_size"
                }
            );
        }
        Ok(())
    }
}
