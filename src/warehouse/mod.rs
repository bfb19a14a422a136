//! Warehouse loading.
//!
//! A load is one asynchronous job on the warehouse side. The [`Warehouse`]
//! trait submits jobs and reports their state; [`WarehouseLoader`] submits a
//! single job and polls it until it finishes, fails or runs out of time. A
//! failed load is never resubmitted: a REPLACE load is only safe to retry once
//! the previous job's outcome is known.

mod bigquery;
mod local;

pub use bigquery::BigQueryWarehouse;
pub use local::LocalWarehouse;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{ParquetCompression, WarehouseBackend, WarehouseConfig, WriteMode};
use crate::emit;
use crate::error::{LoadJobError, PipelineError};
use crate::metrics::events::LoadJobPolled;

/// One bulk load of a published object into a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub source_uri: String,
    pub dataset: String,
    pub table: String,
    pub mode: WriteMode,
}

/// Handle to a submitted load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed(_) => "failed",
        }
    }
}

/// A warehouse that ingests Parquet objects through load jobs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Start a load job. Does not wait for it.
    async fn submit_load(&self, request: &LoadRequest) -> Result<LoadJob, LoadJobError>;

    /// Current state of a job returned by `submit_load`.
    async fn job_state(&self, job: &LoadJob) -> Result<JobState, LoadJobError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Build the warehouse named by the configuration.
pub async fn connect(
    config: &WarehouseConfig,
    storage_options: HashMap<String, String>,
    compression: ParquetCompression,
) -> Result<Arc<dyn Warehouse>, PipelineError> {
    Ok(match &config.backend {
        WarehouseBackend::BigQuery(bq) => Arc::new(BigQueryWarehouse::new(bq)?),
        WarehouseBackend::Local(local) => {
            Arc::new(LocalWarehouse::open(&local.path, storage_options, compression).await?)
        }
    })
}

/// Submits a load and blocks until the job reaches a terminal state.
#[derive(Clone)]
pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, config: &WarehouseConfig) -> Self {
        Self::with_timing(warehouse, config.poll_interval(), config.job_timeout())
    }

    pub fn with_timing(
        warehouse: Arc<dyn Warehouse>,
        poll_interval: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            warehouse,
            poll_interval,
            job_timeout,
        }
    }

    /// Load `uri` into `dataset.table` and wait for the job to complete.
    pub async fn load(
        &self,
        uri: &str,
        dataset: &str,
        table: &str,
        mode: WriteMode,
    ) -> Result<LoadJob, LoadJobError> {
        let request = LoadRequest {
            source_uri: uri.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
            mode,
        };

        let job = self.warehouse.submit_load(&request).await?;
        info!(
            warehouse = self.warehouse.name(),
            job_id = %job.id,
            uri,
            dataset,
            table,
            mode = mode.as_str(),
            "Submitted load job"
        );

        let started = Instant::now();
        match tokio::time::timeout(self.job_timeout, self.wait(&job)).await {
            Ok(Ok(())) => {
                info!(
                    job_id = %job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Load job done"
                );
                Ok(job)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LoadJobError::Timeout {
                job_id: job.id.clone(),
                secs: self.job_timeout.as_secs(),
            }),
        }
    }

    async fn wait(&self, job: &LoadJob) -> Result<(), LoadJobError> {
        loop {
            let state = self.warehouse.job_state(job).await?;
            emit!(LoadJobPolled {
                state: state.as_str()
            });
            match state {
                JobState::Done => return Ok(()),
                JobState::Failed(detail) => {
                    return Err(LoadJobError::JobFailed {
                        job_id: job.id.clone(),
                        detail,
                    });
                }
                JobState::Pending | JobState::Running => {
                    debug!(job_id = %job.id, state = state.as_str(), "Load job in progress");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
