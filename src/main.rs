//! yellowcab: run the taxi trip pipeline once and exit.
//!
//! Exits 0 when the run reaches DONE and 1 otherwise.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use yellowcab::Config;
use yellowcab::error::{ConfigSnafu, MetricsSnafu, PipelineError};
use yellowcab::pipeline::Pipeline;
use yellowcab::{metrics, signal};

/// Download, enrich, publish and load the NYC yellow taxi trip file.
#[derive(Parser, Debug)]
#[command(name = "yellowcab")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and print the plan without running.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    yellowcab::tracing::init_tracing(&args.log_level);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the run reached DONE.
async fn run(args: Args) -> Result<bool, PipelineError> {
    info!("yellowcab starting");

    let config = build_config(&args)?;

    if args.dry_run {
        print_plan(&config);
        return Ok(true);
    }

    if config.metrics.enabled {
        metrics::init(&config.metrics.address).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let shutdown = CancellationToken::new();
    signal::cancel_on_signal(shutdown.clone());

    let mut pipeline = Pipeline::new(config).await?;
    let report = pipeline.run(&shutdown).await;

    if let Some(e) = report.error {
        let stage = report.failed_stage.or_else(|| e.stage());
        error!(
            stage = %stage.map_or("-".to_string(), |s| s.to_string()),
            "{}",
            snafu::Report::from_error(e)
        );
    }
    Ok(report.state == yellowcab::RunState::Done)
}

fn build_config(args: &Args) -> Result<Config, PipelineError> {
    let config = match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu)?,
        None => Config::default(),
    };
    config.validate().context(ConfigSnafu)?;
    Ok(config)
}

fn print_plan(config: &Config) {
    info!("Dry run mode - validating configuration");
    info!("Source: {}", config.source.url);
    info!(
        "Raw copy: {}/{}",
        config.storage.bucket.trim_end_matches('/'),
        config.storage.raw_key()
    );
    info!(
        "Processed copy: {}/{}",
        config.storage.bucket.trim_end_matches('/'),
        config.storage.processed_key()
    );
    info!(
        "Warehouse: {}.{} ({})",
        config.warehouse.dataset,
        config.warehouse.table,
        config.warehouse.mode.as_str()
    );
    if config.relational.enabled {
        info!(
            "Relational: {} (batch size {}, required: {})",
            config.relational.table, config.relational.batch_size, config.relational.required
        );
    }
    info!("Working directory: {}", config.working_dir.display());
    info!("Configuration is valid");
}
