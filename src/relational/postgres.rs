//! PostgreSQL sink over tokio-postgres.
//!
//! Tables are created from the Arrow schema and rows go in as multi-row
//! `INSERT ... VALUES` statements with bound parameters.

use std::env;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Date32Type, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type,
    Schema, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt8Type, UInt16Type, UInt32Type,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pg_escape::quote_identifier;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use super::RelationalSink;
use crate::config::{RelationalConfig, WriteMode};
use crate::error::UpsertError;

/// Postgres caps bound parameters per statement at 65535.
const MAX_PARAMS: usize = 65_535;

const DEFAULT_PORT: u16 = 5432;

/// Resolved connection parameters. Explicit config wins over the `DB_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl ConnectionSettings {
    pub fn resolve(config: &RelationalConfig) -> Self {
        Self::resolve_with(config, |key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Resolve against an arbitrary variable lookup.
    ///
    /// A managed-instance connection name (`project:region:instance`) turns
    /// into the Cloud SQL unix socket directory when no host is given.
    pub fn resolve_with(config: &RelationalConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let instance = config
            .instance_connection_name
            .clone()
            .or_else(|| lookup("CLOUDSQL_CONNECTION_NAME"));

        let host = config
            .host
            .clone()
            .or_else(|| lookup("DB_HOST"))
            .or_else(|| instance.map(|name| format!("/cloudsql/{name}")))
            .unwrap_or_else(|| "localhost".to_string());

        let port = config
            .port
            .or_else(|| lookup("DB_PORT").and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_PORT);

        Self {
            host,
            port,
            database: config
                .database
                .clone()
                .or_else(|| lookup("DB_NAME"))
                .unwrap_or_else(|| "postgres".to_string()),
            user: config
                .user
                .clone()
                .or_else(|| lookup("DB_USER"))
                .unwrap_or_else(|| "postgres".to_string()),
            password: config.password.clone().or_else(|| lookup("DB_PASSWORD")),
        }
    }
}

pub struct PostgresSink {
    client: Client,
}

impl PostgresSink {
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, UpsertError> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&settings.host);
        pg.port(settings.port);
        pg.user(&settings.user);
        pg.dbname(&settings.database);
        if let Some(password) = &settings.password {
            pg.password(password);
        }

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| UpsertError::Connect {
            message: format!(
                "{}@{}:{}/{}: {e}",
                settings.user, settings.host, settings.port, settings.database
            ),
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {e}");
            }
        });

        info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.database,
            "Connected to Postgres"
        );
        Ok(Self { client })
    }

    async fn execute_control(&self, table: &str, sql: &str) -> Result<(), UpsertError> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| UpsertError::Prepare {
                table: table.to_string(),
                message: format!("{sql}: {e}"),
            })
    }
}

#[async_trait]
impl RelationalSink for PostgresSink {
    async fn prepare(
        &mut self,
        table: &str,
        schema: &Schema,
        mode: WriteMode,
    ) -> Result<(), UpsertError> {
        let ddl = match mode {
            WriteMode::Replace => format!(
                "DROP TABLE IF EXISTS {}; {}",
                quote_identifier(table),
                create_table_sql(table, schema, false)?
            ),
            WriteMode::Append => create_table_sql(table, schema, true)?,
        };
        debug!(table, "{ddl}");
        self.execute_control(table, &ddl).await
    }

    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<u64, UpsertError> {
        let columns = batch.num_columns();
        if columns == 0 || batch.num_rows() == 0 {
            return Ok(0);
        }

        let rows_per_statement = (MAX_PARAMS / columns).max(1);
        let names: Vec<&str> = batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();

        let mut written = 0u64;
        let mut start = 0;
        while start < batch.num_rows() {
            let len = rows_per_statement.min(batch.num_rows() - start);
            let chunk = batch.slice(start, len);

            let values = collect_values(&chunk)?;
            let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(SqlValue::as_tosql).collect();
            let sql = insert_sql(table, &names, len);

            written += self
                .client
                .execute(sql.as_str(), &params)
                .await
                .map_err(|e| UpsertError::Prepare {
                    table: table.to_string(),
                    message: e.to_string(),
                })?;
            start += len;
        }
        Ok(written)
    }

    async fn begin(&mut self) -> Result<(), UpsertError> {
        self.execute_control("transaction", "BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), UpsertError> {
        self.execute_control("transaction", "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), UpsertError> {
        self.execute_control("transaction", "ROLLBACK").await
    }
}

/// Map an Arrow type to a Postgres column type.
pub(crate) fn pg_type(data_type: &DataType) -> Option<&'static str> {
    Some(match data_type {
        DataType::Boolean => "BOOLEAN",
        DataType::Int8 | DataType::Int16 | DataType::UInt8 => "SMALLINT",
        DataType::Int32 | DataType::UInt16 => "INTEGER",
        DataType::Int64 | DataType::UInt32 => "BIGINT",
        DataType::Float32 => "REAL",
        DataType::Float64 => "DOUBLE PRECISION",
        DataType::Utf8 | DataType::LargeUtf8 => "TEXT",
        DataType::Date32 => "DATE",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ",
        DataType::Timestamp(_, None) => "TIMESTAMP",
        _ => return None,
    })
}

pub(crate) fn create_table_sql(
    table: &str,
    schema: &Schema,
    if_not_exists: bool,
) -> Result<String, UpsertError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let ty = pg_type(field.data_type()).ok_or_else(|| UpsertError::UnsupportedType {
                column: field.name().clone(),
                data_type: field.data_type().to_string(),
            })?;
            let null = if field.is_nullable() { "" } else { " NOT NULL" };
            Ok(format!("{} {ty}{null}", quote_identifier(field.name())))
        })
        .collect::<Result<Vec<_>, UpsertError>>()?;

    Ok(format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_identifier(table),
        columns.join(", ")
    ))
}

pub(crate) fn insert_sql(table: &str, columns: &[&str], rows: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c).into_owned())
        .collect::<Vec<_>>()
        .join(", ");

    let width = columns.len();
    let tuples = (0..rows)
        .map(|row| {
            let placeholders = (1..=width)
                .map(|col| format!("${}", row * width + col))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({placeholders})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({column_list}) VALUES {tuples}",
        quote_identifier(table)
    )
}

/// One bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Bool(Option<bool>),
    I16(Option<i16>),
    I32(Option<i32>),
    I64(Option<i64>),
    F32(Option<f32>),
    F64(Option<f64>),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
}

impl SqlValue {
    fn as_tosql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlValue::Bool(v) => v,
            SqlValue::I16(v) => v,
            SqlValue::I32(v) => v,
            SqlValue::I64(v) => v,
            SqlValue::F32(v) => v,
            SqlValue::F64(v) => v,
            SqlValue::Text(v) => v,
            SqlValue::Date(v) => v,
            SqlValue::Timestamp(v) => v,
            SqlValue::TimestampTz(v) => v,
        }
    }
}

/// Flatten a batch into row-major parameters.
pub(crate) fn collect_values(batch: &RecordBatch) -> Result<Vec<SqlValue>, UpsertError> {
    let schema = batch.schema();
    let columns = batch
        .columns()
        .iter()
        .zip(schema.fields())
        .map(|(array, field)| {
            column_values(array.as_ref()).ok_or_else(|| UpsertError::UnsupportedType {
                column: field.name().clone(),
                data_type: field.data_type().to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut values = Vec::with_capacity(batch.num_rows() * batch.num_columns());
    for row in 0..batch.num_rows() {
        for column in &columns {
            values.push(column[row].clone());
        }
    }
    Ok(values)
}

fn column_values(array: &dyn Array) -> Option<Vec<SqlValue>> {
    let n = array.len();
    let at = |i: usize| array.is_valid(i);

    let values = match array.data_type() {
        DataType::Boolean => {
            let a = array.as_boolean();
            (0..n).map(|i| SqlValue::Bool(at(i).then(|| a.value(i)))).collect()
        }
        DataType::Int8 => {
            let a = array.as_primitive::<Int8Type>();
            (0..n).map(|i| SqlValue::I16(at(i).then(|| a.value(i).into()))).collect()
        }
        DataType::Int16 => {
            let a = array.as_primitive::<Int16Type>();
            (0..n).map(|i| SqlValue::I16(at(i).then(|| a.value(i)))).collect()
        }
        DataType::UInt8 => {
            let a = array.as_primitive::<UInt8Type>();
            (0..n).map(|i| SqlValue::I16(at(i).then(|| a.value(i).into()))).collect()
        }
        DataType::Int32 => {
            let a = array.as_primitive::<Int32Type>();
            (0..n).map(|i| SqlValue::I32(at(i).then(|| a.value(i)))).collect()
        }
        DataType::UInt16 => {
            let a = array.as_primitive::<UInt16Type>();
            (0..n).map(|i| SqlValue::I32(at(i).then(|| a.value(i).into()))).collect()
        }
        DataType::Int64 => {
            let a = array.as_primitive::<Int64Type>();
            (0..n).map(|i| SqlValue::I64(at(i).then(|| a.value(i)))).collect()
        }
        DataType::UInt32 => {
            let a = array.as_primitive::<UInt32Type>();
            (0..n).map(|i| SqlValue::I64(at(i).then(|| a.value(i).into()))).collect()
        }
        DataType::Float32 => {
            let a = array.as_primitive::<Float32Type>();
            (0..n).map(|i| SqlValue::F32(at(i).then(|| a.value(i)))).collect()
        }
        DataType::Float64 => {
            let a = array.as_primitive::<Float64Type>();
            (0..n).map(|i| SqlValue::F64(at(i).then(|| a.value(i)))).collect()
        }
        DataType::Utf8 => {
            let a = array.as_string::<i32>();
            (0..n)
                .map(|i| SqlValue::Text(at(i).then(|| a.value(i).to_string())))
                .collect()
        }
        DataType::LargeUtf8 => {
            let a = array.as_string::<i64>();
            (0..n)
                .map(|i| SqlValue::Text(at(i).then(|| a.value(i).to_string())))
                .collect()
        }
        DataType::Date32 => {
            let a = array.as_primitive::<Date32Type>();
            (0..n)
                .map(|i| SqlValue::Date(at(i).then(|| days_to_date(a.value(i))).flatten()))
                .collect()
        }
        DataType::Timestamp(unit, tz) => {
            let micros: Vec<Option<i64>> = match unit {
                TimeUnit::Second => {
                    let a = array.as_primitive::<TimestampSecondType>();
                    (0..n).map(|i| at(i).then(|| a.value(i).saturating_mul(1_000_000))).collect()
                }
                TimeUnit::Millisecond => {
                    let a = array.as_primitive::<TimestampMillisecondType>();
                    (0..n).map(|i| at(i).then(|| a.value(i).saturating_mul(1_000))).collect()
                }
                TimeUnit::Microsecond => {
                    let a = array.as_primitive::<TimestampMicrosecondType>();
                    (0..n).map(|i| at(i).then(|| a.value(i))).collect()
                }
                TimeUnit::Nanosecond => {
                    let a = array.as_primitive::<TimestampNanosecondType>();
                    (0..n).map(|i| at(i).then(|| a.value(i).div_euclid(1_000))).collect()
                }
            };
            if tz.is_some() {
                micros
                    .into_iter()
                    .map(|m| SqlValue::TimestampTz(m.and_then(DateTime::<Utc>::from_timestamp_micros)))
                    .collect()
            } else {
                micros
                    .into_iter()
                    .map(|m| {
                        SqlValue::Timestamp(
                            m.and_then(DateTime::<Utc>::from_timestamp_micros)
                                .map(|dt| dt.naive_utc()),
                        )
                    })
                    .collect()
            }
        }
        _ => return None,
    };
    Some(values)
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(chrono::Duration::days(days.into()))
}
