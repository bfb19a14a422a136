//! Optional relational sink for the transformed table.
//!
//! Rows are written in fixed-size batches. By default every batch commits on
//! its own: a failure part-way through leaves the earlier batches in place and
//! the error says how many rows were already committed. With
//! `transactional: true` the whole upsert runs in one transaction and a
//! failure leaves the target untouched.

mod postgres;

pub use postgres::{ConnectionSettings, PostgresSink};

use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::WriteMode;
use crate::emit;
use crate::error::{UpsertBatchSnafu, UpsertError};
use crate::metrics::events::RowsUpserted;
use crate::table::Table;

/// A database that accepts Arrow batches.
#[async_trait]
pub trait RelationalSink: Send + Sync {
    /// Create the target table, or recreate it for REPLACE.
    async fn prepare(&mut self, table: &str, schema: &Schema, mode: WriteMode)
    -> Result<(), UpsertError>;

    /// Insert every row of `batch`; returns the number of rows written.
    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<u64, UpsertError>;

    async fn begin(&mut self) -> Result<(), UpsertError>;

    async fn commit(&mut self) -> Result<(), UpsertError>;

    async fn rollback(&mut self) -> Result<(), UpsertError>;
}

#[async_trait]
impl<S: RelationalSink + ?Sized> RelationalSink for Box<S> {
    async fn prepare(
        &mut self,
        table: &str,
        schema: &Schema,
        mode: WriteMode,
    ) -> Result<(), UpsertError> {
        (**self).prepare(table, schema, mode).await
    }

    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<u64, UpsertError> {
        (**self).write_batch(table, batch).await
    }

    async fn begin(&mut self) -> Result<(), UpsertError> {
        (**self).begin().await
    }

    async fn commit(&mut self) -> Result<(), UpsertError> {
        (**self).commit().await
    }

    async fn rollback(&mut self) -> Result<(), UpsertError> {
        (**self).rollback().await
    }
}

pub struct RelationalLoader<S> {
    sink: S,
    transactional: bool,
}

impl<S: RelationalSink> RelationalLoader<S> {
    pub fn new(sink: S, transactional: bool) -> Self {
        Self {
            sink,
            transactional,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Write `table` into `table_name` and return the number of rows written.
    pub async fn upsert(
        &mut self,
        table_name: &str,
        table: &Table,
        mode: WriteMode,
        batch_size: usize,
    ) -> Result<u64, UpsertError> {
        let batch_size = batch_size.max(1);

        if !self.transactional {
            self.sink.prepare(table_name, table.schema(), mode).await?;
            return self.write_all(table_name, table, batch_size, true).await;
        }

        self.sink.begin().await?;
        let result = match self.sink.prepare(table_name, table.schema(), mode).await {
            Ok(()) => self.write_all(table_name, table, batch_size, false).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(rows) => {
                self.sink.commit().await?;
                info!(table = table_name, rows, "Relational upsert committed");
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = self.sink.rollback().await {
                    warn!(table = table_name, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_all(
        &mut self,
        table_name: &str,
        table: &Table,
        batch_size: usize,
        autocommit: bool,
    ) -> Result<u64, UpsertError> {
        let mut written = 0u64;
        let mut index = 0usize;

        for batch in table.batches() {
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = batch_size.min(batch.num_rows() - offset);
                let slice = batch.slice(offset, len);

                match self.sink.write_batch(table_name, &slice).await {
                    Ok(rows) => {
                        written += rows;
                        emit!(RowsUpserted { count: rows });
                        debug!(table = table_name, batch = index, rows, "Wrote batch");
                    }
                    Err(e) => {
                        return UpsertBatchSnafu {
                            table: table_name,
                            batch: index,
                            rows_committed: if autocommit { written } else { 0 },
                            message: e.to_string(),
                        }
                        .fail();
                    }
                }
                offset += len;
                index += 1;
            }
        }

        if autocommit {
            info!(table = table_name, rows = written, "Relational upsert finished");
        }
        Ok(written)
    }
}
