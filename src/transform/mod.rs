//! Derived columns for the trip table.
//!
//! The transform is additive: every input column and row is kept as is, and two
//! columns are appended, the squared fare and the load timestamp.

use arrow::array::{ArrayRef, AsArray, RecordBatch, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::sync::Arc;

use crate::config::TransformConfig;
use crate::error::{ComputeSnafu, ConflictSnafu, MissingColumnSnafu, NonNumericSnafu, SchemaError};
use crate::table::Table;

#[derive(Debug, Clone)]
pub struct Transformer {
    fare_column: String,
    squared_column: String,
    load_timestamp_column: String,
}

impl Transformer {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            fare_column: config.fare_column.clone(),
            squared_column: config.squared_column.clone(),
            load_timestamp_column: config.load_timestamp_column.clone(),
        }
    }

    /// Derive the extra columns, stamping every row with the current time.
    pub fn transform(&self, table: &Table) -> Result<Table, SchemaError> {
        self.transform_at(table, Utc::now())
    }

    /// Same as [`Transformer::transform`] with a caller-chosen load time.
    pub fn transform_at(&self, table: &Table, loaded_at: DateTime<Utc>) -> Result<Table, SchemaError> {
        let input = table.schema();
        let fare_index = self.check_input(input)?;
        let fare_nullable = input.field(fare_index).is_nullable();

        let mut fields: Vec<Field> = input.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(&self.squared_column, DataType::Float64, fare_nullable));
        fields.push(Field::new(
            &self.load_timestamp_column,
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ));
        let schema: SchemaRef = Arc::new(Schema::new_with_metadata(fields, input.metadata().clone()));

        let stamp = loaded_at.timestamp_micros();
        let batches = table
            .batches()
            .iter()
            .map(|batch| derive_batch(batch, fare_index, stamp, &schema))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Table::new(schema, batches))
    }

    fn check_input(&self, schema: &Schema) -> Result<usize, SchemaError> {
        let index = schema
            .index_of(&self.fare_column)
            .ok()
            .context(MissingColumnSnafu {
                column: &self.fare_column,
            })?;

        let data_type = schema.field(index).data_type();
        ensure!(
            data_type.is_numeric(),
            NonNumericSnafu {
                column: &self.fare_column,
                data_type: data_type.to_string(),
            }
        );

        for derived in [&self.squared_column, &self.load_timestamp_column] {
            ensure!(
                schema.index_of(derived).is_err(),
                ConflictSnafu { column: derived }
            );
        }
        Ok(index)
    }
}

fn derive_batch(
    batch: &RecordBatch,
    fare_index: usize,
    stamp: i64,
    schema: &SchemaRef,
) -> Result<RecordBatch, SchemaError> {
    let fare = cast(batch.column(fare_index), &DataType::Float64).context(ComputeSnafu)?;
    let squared = fare
        .as_primitive::<Float64Type>()
        .unary::<_, Float64Type>(|v| v * v);
    let loaded_at = TimestampMicrosecondArray::from_value(stamp, batch.num_rows()).with_timezone("UTC");

    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns.push(Arc::new(squared));
    columns.push(Arc::new(loaded_at));

    RecordBatch::try_new(schema.clone(), columns).context(ComputeSnafu)
}
