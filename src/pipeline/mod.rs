//! The run orchestrator.
//!
//! A run walks the fixed stage order
//! `FETCHING → PUBLISHING_RAW → READING → TRANSFORMING → WRITING →
//! PUBLISHING_PROCESSED → LOADING` one stage at a time. The first stage error
//! moves the run to `FAILED`; `DONE` is reached only when the warehouse load
//! finished.
//!
//! Each stage is raced against the shutdown token. Parquet decode, the
//! transform and Parquet encode run on Tokio's blocking pool.

mod state;

pub use state::{Artifacts, Run, RunState, Transition};

use snafu::prelude::*;
use std::fs::{File, OpenOptions, TryLockError};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, OnFetchFailure, RelationalConfig};
use crate::emit;
use crate::error::{
    CancelledSnafu, FetchError, PipelineError, RunLockedSnafu, TaskJoinSnafu, WorkingDirSnafu,
};
use crate::fetch::Fetcher;
use crate::metrics::events::{
    RowsTransformed, RunCompleted, StageCompleted, StageDuration, StageFailed,
};
use crate::publish::Publisher;
use crate::relational::{ConnectionSettings, PostgresSink, RelationalLoader, RelationalSink};
use crate::table::{self, Table};
use crate::transform::Transformer;
use crate::warehouse::{self, Warehouse, WarehouseLoader};

/// Local name of the downloaded source file. Fixed across runs so a failed
/// download can fall back to the previous file.
pub const RAW_FILE: &str = "yellow_tripdata_.parquet";

/// Local name of the transformed file.
pub const PROCESSED_FILE: &str = "yellow_tripdata_processed.parquet";

/// Held in the working directory for the duration of a run.
pub const LOCK_FILE: &str = ".yellowcab.lock";

/// What happened on the relational side branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationalOutcome {
    /// Branch disabled, or the run failed before reaching it.
    Skipped,
    Upserted { table: String, rows: u64 },
    Failed { table: String, error: String },
}

/// Final account of a run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// The stage that was running when the run failed.
    pub failed_stage: Option<RunState>,
    pub transitions: Vec<Transition>,
    pub artifacts: Artifacts,
    pub rows: u64,
    pub error: Option<PipelineError>,
    pub relational: RelationalOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }
}

pub struct Pipeline {
    config: Config,
    fetcher: Fetcher,
    publisher: Publisher,
    transformer: Transformer,
    loader: WarehouseLoader,
    relational: Option<Box<dyn RelationalSink>>,
}

impl Pipeline {
    /// Validate `config` and connect to the bucket and warehouse it names.
    ///
    /// The relational sink, when enabled, connects on first use so an
    /// unreachable database only affects that branch.
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;

        let publisher = Publisher::connect(&config.storage).await?;
        let warehouse = warehouse::connect(
            &config.warehouse,
            config.storage.storage_options.clone(),
            config.parquet.compression,
        )
        .await?;

        Self::with_components(config, publisher, warehouse, None)
    }

    /// Build a pipeline around already-constructed collaborators.
    pub fn with_components(
        config: Config,
        publisher: Publisher,
        warehouse: Arc<dyn Warehouse>,
        relational: Option<Box<dyn RelationalSink>>,
    ) -> Result<Self, PipelineError> {
        let fetcher = Fetcher::new(&config.source)?;
        let transformer = Transformer::new(&config.transform);
        let loader = WarehouseLoader::new(warehouse, &config.warehouse);

        Ok(Self {
            config,
            fetcher,
            publisher,
            transformer,
            loader,
            relational,
        })
    }

    /// Execute one run. Never returns early: every outcome, including
    /// cancellation, ends up in the report.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> RunReport {
        let started = Instant::now();
        let mut run = Run::new(&self.config.source.url, &self.config.working_dir);
        info!(
            run_id = %run.run_id,
            source = %run.source_url,
            working_dir = %run.working_dir.display(),
            "Starting run"
        );

        let mut relational = RelationalOutcome::Skipped;
        let result = self.execute(&mut run, &mut relational, shutdown).await;

        let (failed_stage, error) = match result {
            Ok(()) => (None, None),
            Err(e) => {
                let stage = run.fail();
                emit!(StageFailed { stage });
                error!(run_id = %run.run_id, stage = %stage, error = %e, "Run failed");
                (Some(stage), Some(e))
            }
        };

        let elapsed = started.elapsed();
        emit!(RunCompleted {
            state: run.state(),
            duration: elapsed,
            rows: run.rows,
        });
        info!(
            run_id = %run.run_id,
            state = %run.state(),
            rows = run.rows,
            raw_uri = run.artifacts.raw_uri.as_deref().unwrap_or("-"),
            processed_uri = run.artifacts.processed_uri.as_deref().unwrap_or("-"),
            load_job = run.artifacts.load_job.as_deref().unwrap_or("-"),
            relational = ?relational,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run finished"
        );

        let run_id = run.run_id;
        let state = run.state();
        let rows = run.rows;
        let (transitions, artifacts) = run.into_parts();

        RunReport {
            run_id,
            state,
            failed_stage,
            transitions,
            artifacts,
            rows,
            error,
            relational,
        }
    }

    async fn execute(
        &mut self,
        run: &mut Run,
        relational: &mut RelationalOutcome,
        shutdown: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let working_dir = self.config.working_dir.clone();
        tokio::fs::create_dir_all(&working_dir)
            .await
            .context(WorkingDirSnafu {
                path: working_dir.display().to_string(),
            })?;
        let _lock = RunLock::acquire(&working_dir, run.run_id)?;

        let raw_path = working_dir.join(RAW_FILE);
        let processed_path = working_dir.join(PROCESSED_FILE);

        // FETCHING
        let fetched = stage(run, shutdown, self.fetch_source(&raw_path)).await?;
        run.artifacts.raw_path = Some(fetched.clone());

        // PUBLISHING_RAW
        let raw_key = self.config.storage.raw_key();
        let raw_uri = stage(run, shutdown, self.publisher.publish(&fetched, &raw_key)).await?;
        run.artifacts.raw_uri = Some(raw_uri);

        // READING
        let input = stage(run, shutdown, blocking(move || table::read(&fetched))).await?;

        // TRANSFORMING
        let transformer = self.transformer.clone();
        let output = stage(
            run,
            shutdown,
            blocking(move || transformer.transform(&input)),
        )
        .await?;
        run.rows = output.num_rows() as u64;
        emit!(RowsTransformed { count: run.rows });

        if self.config.relational.enabled {
            let table_name = self.config.relational.table.clone();
            match self.upsert_relational(&output, shutdown).await {
                Ok(rows) => {
                    *relational = RelationalOutcome::Upserted {
                        table: table_name,
                        rows,
                    };
                }
                Err(e) => {
                    *relational = RelationalOutcome::Failed {
                        table: table_name.clone(),
                        error: e.to_string(),
                    };
                    if self.config.relational.required
                        || matches!(e, PipelineError::Cancelled { .. })
                    {
                        return Err(e);
                    }
                    warn!(
                        run_id = %run.run_id,
                        table = %table_name,
                        error = %e,
                        "Relational upsert failed, continuing with the warehouse load"
                    );
                }
            }
        }

        // WRITING
        let compression = self.config.parquet.compression;
        let written = stage(
            run,
            shutdown,
            blocking(move || table::write(&output, &processed_path, compression)),
        )
        .await?;
        run.artifacts.processed_path = Some(written.clone());

        // PUBLISHING_PROCESSED
        let processed_key = self.config.storage.processed_key();
        let processed_uri =
            stage(run, shutdown, self.publisher.publish(&written, &processed_key)).await?;
        run.artifacts.processed_uri = Some(processed_uri.clone());

        // LOADING
        let target = &self.config.warehouse;
        let job = stage(
            run,
            shutdown,
            self.loader
                .load(&processed_uri, &target.dataset, &target.table, target.mode),
        )
        .await?;
        run.artifacts.load_job = Some(job.id);

        run.advance();
        Ok(())
    }

    /// Download the source, falling back to the previous file when allowed.
    async fn fetch_source(&self, destination: &Path) -> Result<PathBuf, FetchError> {
        let source = &self.config.source;
        match self.fetcher.fetch(&source.url, destination).await {
            Ok(path) => Ok(path),
            Err(e) if source.on_fetch_failure == OnFetchFailure::ReuseExisting => {
                if tokio::fs::try_exists(destination).await.unwrap_or(false) {
                    warn!(
                        error = %e,
                        path = %destination.display(),
                        "Source download failed, reusing the existing file"
                    );
                    Ok(destination.to_path_buf())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert_relational(
        &mut self,
        table: &Table,
        shutdown: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let settings = self.config.relational.clone();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                warn!(table = %settings.table, "Shutdown requested, abandoning relational upsert");
                CancelledSnafu { stage: RunState::Transforming }.fail()
            }

            result = self.connect_and_upsert(table, &settings) => result,
        }
    }

    async fn connect_and_upsert(
        &mut self,
        table: &Table,
        settings: &RelationalConfig,
    ) -> Result<u64, PipelineError> {
        let sink = match self.relational.take() {
            Some(sink) => sink,
            None => {
                let connection = ConnectionSettings::resolve(settings);
                Box::new(PostgresSink::connect(&connection).await?) as Box<dyn RelationalSink>
            }
        };

        let mut loader = RelationalLoader::new(sink, settings.transactional);
        let result = loader
            .upsert(&settings.table, table, settings.mode, settings.batch_size)
            .await;
        self.relational = Some(loader.into_sink());

        Ok(result?)
    }
}

/// Advance `run` into its next stage and drive `work` to completion unless
/// the token fires first.
async fn stage<T, E>(
    run: &mut Run,
    shutdown: &CancellationToken,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, PipelineError>
where
    PipelineError: From<E>,
{
    let stage = run.advance();
    let started = Instant::now();

    let result = tokio::select! {
        biased;

        _ = shutdown.cancelled() => {
            warn!(run_id = %run.run_id, stage = %stage, "Shutdown requested, abandoning stage");
            return CancelledSnafu { stage }.fail();
        }

        result = work => result.map_err(PipelineError::from),
    };

    emit!(StageDuration {
        stage,
        duration: started.elapsed(),
    });
    if result.is_ok() {
        emit!(StageCompleted { stage });
    }
    result
}

async fn blocking<T, E, F>(f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    PipelineError: From<E>,
{
    tokio::task::spawn_blocking(f)
        .await
        .context(TaskJoinSnafu)?
        .map_err(PipelineError::from)
}

/// Exclusive advisory lock on a working directory.
///
/// The lock lives on the open handle, so the OS releases it when the handle
/// closes or the process dies. The file itself stays behind and only records
/// the id of the last run that held it.
struct RunLock {
    _file: File,
}

impl RunLock {
    fn acquire(dir: &Path, run_id: Uuid) -> Result<Self, PipelineError> {
        let path = dir.join(LOCK_FILE);
        let display = path.display().to_string();

        // Truncating before the lock is held would clobber a live holder's id.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(WorkingDirSnafu {
                path: display.clone(),
            })?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return RunLockedSnafu { path: display }.fail(),
            Err(TryLockError::Error(source)) => {
                return Err(PipelineError::WorkingDir {
                    path: display,
                    source,
                });
            }
        }

        file.set_len(0)
            .and_then(|()| writeln!(file, "{run_id}"))
            .context(WorkingDirSnafu { path: display })?;

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let first = RunLock::acquire(dir.path(), Uuid::now_v7()).unwrap();

        let err = RunLock::acquire(dir.path(), Uuid::now_v7()).err().unwrap();
        assert!(matches!(err, PipelineError::RunLocked { .. }));

        drop(first);
        let _again = RunLock::acquire(dir.path(), Uuid::now_v7()).unwrap();
    }

    #[test]
    fn test_leftover_lock_file_without_holder_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "0190f5c2-dead-7000-8000-000000000000\n")
            .unwrap();

        let run_id = Uuid::now_v7();
        let _lock = RunLock::acquire(dir.path(), run_id).unwrap();
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content, format!("{run_id}\n"));
    }

    #[test]
    fn test_failed_acquire_keeps_holder_run_id() {
        let dir = TempDir::new().unwrap();
        let holder = Uuid::now_v7();
        let _lock = RunLock::acquire(dir.path(), holder).unwrap();

        assert!(RunLock::acquire(dir.path(), Uuid::now_v7()).is_err());
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content.trim(), holder.to_string());
    }

    #[tokio::test]
    async fn test_stage_advances_and_reports_cancellation() {
        let mut run = Run::new("u", ".");
        let token = CancellationToken::new();

        let value = stage(&mut run, &token, async { Ok::<_, PipelineError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(run.state(), RunState::Fetching);

        token.cancel();
        let err = stage(&mut run, &token, std::future::pending::<Result<(), PipelineError>>())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Cancelled {
                stage: RunState::PublishingRaw
            }
        ));
    }

    #[tokio::test]
    async fn test_blocking_propagates_errors() {
        let err = blocking(|| {
            crate::error::MissingColumnSnafu {
                column: "total_amount",
            }
            .fail::<()>()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }
}
