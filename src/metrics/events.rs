//! Internal events for metrics emission.
//!
//! Each struct is one measurable occurrence in a run. Emitting it records the
//! matching counter, gauge or histogram and leaves a trace-level log line.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::pipeline::RunState;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    fn emit(self);
}

/// A stage finished and the run advanced.
pub struct StageCompleted {
    pub stage: RunState,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Stage completed");
        counter!("yellowcab_stages_completed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// A stage failed and moved the run to FAILED.
pub struct StageFailed {
    pub stage: RunState,
}

impl InternalEvent for StageFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Stage failed");
        counter!("yellowcab_stages_failed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Wall-clock time spent in one stage.
pub struct StageDuration {
    pub stage: RunState,
    pub duration: Duration,
}

impl InternalEvent for StageDuration {
    fn emit(self) {
        trace!(
            stage = self.stage.as_str(),
            duration_ms = self.duration.as_millis(),
            "Stage duration"
        );
        histogram!("yellowcab_stage_duration_seconds", "stage" => self.stage.as_str())
            .record(self.duration.as_secs_f64());
    }
}

/// Outcome of one HTTP attempt against the source.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome {
    Success,
    Retryable,
    Fatal,
}

impl FetchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::Retryable => "retryable",
            FetchOutcome::Fatal => "fatal",
        }
    }
}

pub struct FetchAttempt {
    pub outcome: FetchOutcome,
}

impl InternalEvent for FetchAttempt {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Fetch attempt");
        counter!("yellowcab_fetch_attempts_total", "outcome" => self.outcome.as_str())
            .increment(1);
    }
}

pub struct BytesDownloaded {
    pub bytes: u64,
}

impl InternalEvent for BytesDownloaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes downloaded");
        counter!("yellowcab_bytes_downloaded_total").increment(self.bytes);
    }
}

pub struct BytesUploaded {
    pub bytes: u64,
}

impl InternalEvent for BytesUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes uploaded");
        counter!("yellowcab_bytes_uploaded_total").increment(self.bytes);
    }
}

pub struct RowsTransformed {
    pub count: u64,
}

impl InternalEvent for RowsTransformed {
    fn emit(self) {
        trace!(count = self.count, "Rows transformed");
        counter!("yellowcab_rows_transformed_total").increment(self.count);
    }
}

/// One poll of a warehouse load job.
pub struct LoadJobPolled {
    pub state: &'static str,
}

impl InternalEvent for LoadJobPolled {
    fn emit(self) {
        trace!(state = self.state, "Load job polled");
        counter!("yellowcab_load_job_polls_total", "state" => self.state).increment(1);
    }
}

pub struct RowsUpserted {
    pub count: u64,
}

impl InternalEvent for RowsUpserted {
    fn emit(self) {
        trace!(count = self.count, "Rows upserted");
        counter!("yellowcab_rows_upserted_total").increment(self.count);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Rename,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Rename => "rename",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "yellowcab_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "yellowcab_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Run summary
// ============================================================================

/// The run reached a terminal state.
pub struct RunCompleted {
    pub state: RunState,
    pub duration: Duration,
    pub rows: u64,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            state = self.state.as_str(),
            duration_ms = self.duration.as_millis(),
            rows = self.rows,
            "Run completed"
        );
        counter!("yellowcab_runs_total", "state" => self.state.as_str()).increment(1);
        histogram!("yellowcab_run_duration_seconds").record(self.duration.as_secs_f64());
        gauge!("yellowcab_last_run_rows").set(self.rows as f64);
    }
}
