//! Directory-backed warehouse.
//!
//! Each table is one Parquet file at `<root>/<dataset>/<table>.parquet`. Load
//! jobs run to completion on submission; the job map only remembers outcomes.
//! REPLACE swaps the table file with a temp-file rename, so a reader sees
//! either the previous contents or the new ones.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::PutPayload;
use object_store::path::Path as ObjectPath;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ParquetCompression, WriteMode};
use crate::error::{IoSnafu, LoadJobError, StorageError};
use crate::storage::StorageProvider;
use crate::table::{self, Table};

use super::{JobState, LoadJob, LoadRequest, Warehouse};

pub struct LocalWarehouse {
    root: StorageProvider,
    source_options: HashMap<String, String>,
    compression: ParquetCompression,
    jobs: Mutex<HashMap<String, JobState>>,
}

impl LocalWarehouse {
    /// Open (creating if needed) the warehouse rooted at `path`.
    ///
    /// `source_options` are used to read published objects.
    pub async fn open(
        path: &Path,
        source_options: HashMap<String, String>,
        compression: ParquetCompression,
    ) -> Result<Self, StorageError> {
        let absolute = std::path::absolute(path).context(IoSnafu)?;
        let root = StorageProvider::for_url_with_options(
            &absolute.display().to_string(),
            HashMap::new(),
        )
        .await?;

        Ok(Self {
            root,
            source_options,
            compression,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn table_path(dataset: &str, table: &str) -> ObjectPath {
        ObjectPath::from(format!("{dataset}/{table}.parquet"))
    }

    /// Current contents of `dataset.table`, or `None` if it was never loaded.
    pub async fn read_table(&self, dataset: &str, table: &str) -> Result<Option<Table>, LoadJobError> {
        let qualified = format!("{dataset}.{table}");
        match self.root.get(&Self::table_path(dataset, table)).await {
            Ok(bytes) => decode(bytes, qualified.clone())
                .await
                .map(Some)
                .map_err(|message| LoadJobError::ReadTable {
                    table: qualified,
                    message,
                }),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(LoadJobError::ReadTable {
                table: qualified,
                message: e.to_string(),
            }),
        }
    }

    async fn run_job(&self, request: &LoadRequest) -> Result<u64, String> {
        let (source, key) =
            StorageProvider::for_object_uri(&request.source_uri, self.source_options.clone())
                .await
                .map_err(|e| e.to_string())?;
        let payload = source.get(&key).await.map_err(|e| e.to_string())?;
        let incoming = decode(payload.clone(), request.source_uri.clone()).await?;
        let rows = incoming.num_rows() as u64;
        let target = Self::table_path(&request.dataset, &request.table);

        let content = match request.mode {
            WriteMode::Replace => payload,
            WriteMode::Append => match self.existing(&request.dataset, &request.table).await? {
                None => payload,
                Some(current) => self.append(current, incoming).await?,
            },
        };

        self.root
            .atomic_put(&target, PutPayload::from(content))
            .await
            .map_err(|e| e.to_string())?;
        Ok(rows)
    }

    async fn existing(&self, dataset: &str, table: &str) -> Result<Option<Table>, String> {
        self.read_table(dataset, table)
            .await
            .map_err(|e| e.to_string())
    }

    async fn append(&self, current: Table, incoming: Table) -> Result<Bytes, String> {
        if current.schema().fields() != incoming.schema().fields() {
            return Err(format!(
                "schema of loaded file does not match table: expected {:?}, got {:?}",
                current.schema().fields(),
                incoming.schema().fields()
            ));
        }
        let schema = current.schema().clone();
        let batches = current
            .batches()
            .iter()
            .chain(incoming.batches())
            .cloned()
            .collect();
        let combined = Table::new(schema, batches);
        let compression = self.compression;

        tokio::task::spawn_blocking(move || table::encode(&combined, compression))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }
}

async fn decode(bytes: Bytes, origin: String) -> Result<Table, String> {
    tokio::task::spawn_blocking(move || table::decode_bytes(bytes, &origin))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    async fn submit_load(&self, request: &LoadRequest) -> Result<LoadJob, LoadJobError> {
        let id = format!("local-{}", Uuid::now_v7());
        let state = match self.run_job(request).await {
            Ok(rows) => {
                debug!(job_id = %id, rows, table = %request.table, "Local load finished");
                JobState::Done
            }
            Err(message) => {
                warn!(job_id = %id, error = %message, "Local load failed");
                JobState::Failed(message)
            }
        };

        self.jobs
            .lock()
            .map_err(|_| LoadJobError::Submit {
                uri: request.source_uri.clone(),
                message: "job registry poisoned".to_string(),
            })?
            .insert(id.clone(), state);

        Ok(LoadJob { id, location: None })
    }

    async fn job_state(&self, job: &LoadJob) -> Result<JobState, LoadJobError> {
        let jobs = self.jobs.lock().map_err(|_| LoadJobError::Poll {
            job_id: job.id.clone(),
            message: "job registry poisoned".to_string(),
        })?;
        jobs.get(&job.id).cloned().ok_or_else(|| LoadJobError::Poll {
            job_id: job.id.clone(),
            message: "unknown job".to_string(),
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::WarehouseLoader;
    use arrow::array::{Float64Array, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn trips(ids: &[i64]) -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("VendorID", DataType::Int64, false),
            Field::new("total_amount", DataType::Float64, false),
        ]));
        let fares: Vec<f64> = ids.iter().map(|i| *i as f64 * 1.5).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(Float64Array::from(fares)),
            ],
        )
        .unwrap();
        Table::new(schema, vec![batch])
    }

    async fn publish(dir: &TempDir, name: &str, table: &Table) -> String {
        let bucket =
            StorageProvider::for_url_with_options(&dir.path().join("bucket").display().to_string(), HashMap::new())
                .await
                .unwrap();
        let path = ObjectPath::from(format!("processed/{name}"));
        let bytes = table::encode(table, ParquetCompression::Snappy).unwrap();
        bucket.put_payload(&path, PutPayload::from(bytes)).await.unwrap();
        bucket.object_uri(&path)
    }

    async fn setup() -> (TempDir, Arc<LocalWarehouse>, WarehouseLoader) {
        let dir = TempDir::new().unwrap();
        let warehouse = Arc::new(
            LocalWarehouse::open(&dir.path().join("warehouse"), HashMap::new(), ParquetCompression::Snappy)
                .await
                .unwrap(),
        );
        let loader = WarehouseLoader::with_timing(
            warehouse.clone(),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        (dir, warehouse, loader)
    }

    #[tokio::test]
    async fn test_replace_load_then_read_returns_loaded_rows() {
        let (dir, warehouse, loader) = setup().await;
        let table = trips(&[1, 2, 3]);
        let uri = publish(&dir, "a.parquet", &table).await;

        loader
            .load(&uri, "data_pipeline", "yellow_taxi_trips", WriteMode::Replace)
            .await
            .unwrap();

        let stored = warehouse
            .read_table("data_pipeline", "yellow_taxi_trips")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, table);
    }

    #[tokio::test]
    async fn test_replace_discards_previous_rows() {
        let (dir, warehouse, loader) = setup().await;
        let first = publish(&dir, "a.parquet", &trips(&[1, 2, 3])).await;
        let second_table = trips(&[7]);
        let second = publish(&dir, "b.parquet", &second_table).await;

        loader.load(&first, "d", "t", WriteMode::Replace).await.unwrap();
        loader.load(&second, "d", "t", WriteMode::Replace).await.unwrap();

        let stored = warehouse.read_table("d", "t").await.unwrap().unwrap();
        assert_eq!(stored, second_table);
    }

    #[tokio::test]
    async fn test_append_accumulates_rows() {
        let (dir, warehouse, loader) = setup().await;
        let first = publish(&dir, "a.parquet", &trips(&[1, 2])).await;
        let second = publish(&dir, "b.parquet", &trips(&[3])).await;

        loader.load(&first, "d", "t", WriteMode::Append).await.unwrap();
        loader.load(&second, "d", "t", WriteMode::Append).await.unwrap();

        let stored = warehouse.read_table("d", "t").await.unwrap().unwrap();
        assert_eq!(stored, trips(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn test_corrupt_object_fails_job_and_keeps_table() {
        let (dir, warehouse, loader) = setup().await;
        let good = publish(&dir, "a.parquet", &trips(&[1])).await;
        loader.load(&good, "d", "t", WriteMode::Replace).await.unwrap();

        let bucket = dir.path().join("bucket/processed/bad.parquet");
        std::fs::write(&bucket, b"not parquet").unwrap();
        let bad = format!("file://{}", bucket.display());

        let err = loader.load(&bad, "d", "t", WriteMode::Replace).await.unwrap_err();
        assert!(matches!(err, LoadJobError::JobFailed { .. }));

        let stored = warehouse.read_table("d", "t").await.unwrap().unwrap();
        assert_eq!(stored, trips(&[1]));
    }

    #[tokio::test]
    async fn test_missing_object_fails_job() {
        let (dir, _warehouse, loader) = setup().await;
        let uri = format!("file://{}/bucket/processed/none.parquet", dir.path().display());
        let err = loader.load(&uri, "d", "t", WriteMode::Replace).await.unwrap_err();
        assert!(matches!(err, LoadJobError::JobFailed { .. }));
    }

    #[tokio::test]
    async fn test_unloaded_table_reads_as_none() {
        let (_dir, warehouse, _loader) = setup().await;
        assert!(warehouse.read_table("d", "never").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_rejects_schema_mismatch() {
        let (dir, _warehouse, loader) = setup().await;
        let first = publish(&dir, "a.parquet", &trips(&[1])).await;
        loader.load(&first, "d", "t", WriteMode::Append).await.unwrap();

        let other_schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let other = Table::new(
            other_schema.clone(),
            vec![RecordBatch::try_new(other_schema, vec![Arc::new(Int64Array::from(vec![9]))]).unwrap()],
        );
        let second = publish(&dir, "b.parquet", &other).await;

        let err = loader.load(&second, "d", "t", WriteMode::Append).await.unwrap_err();
        match err {
            LoadJobError::JobFailed { detail, .. } => assert!(detail.contains("schema")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
