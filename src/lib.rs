//! yellowcab: a batch ETL runner for the NYC yellow taxi trip file.
//!
//! One run downloads the source Parquet file, publishes the raw copy to object
//! storage, adds derived columns, publishes the processed copy and loads it
//! into a warehouse table. An optional relational sink receives the same rows.
//!
//! # Example
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use yellowcab::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), yellowcab::error::PipelineError> {
//!     let config = Config::from_file("yellowcab.yaml")?;
//!     let mut pipeline = Pipeline::new(config).await?;
//!     let report = pipeline.run(&CancellationToken::new()).await;
//!     println!("{} rows, state {}", report.rows, report.state);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod relational;
pub mod signal;
pub mod storage;
pub mod table;
pub mod tracing;
pub mod transform;
pub mod warehouse;

pub use config::Config;
pub use pipeline::{Pipeline, RunReport, RunState};
pub use storage::StorageProvider;
