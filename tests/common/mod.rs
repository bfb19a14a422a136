//! Shared fixtures: a canned HTTP source, trip files and a local deployment
//! (file bucket plus directory warehouse) rooted in a temp dir.

#![allow(dead_code)]

use arrow::array::{Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use yellowcab::config::{
    LocalWarehouseConfig, ParquetCompression, WarehouseBackend, WarehouseConfig,
};
use yellowcab::table::{self, Table};
use yellowcab::warehouse::LocalWarehouse;
use yellowcab::Config;

pub fn response(status: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn ok(body: &[u8]) -> Vec<u8> {
    response("200 OK", body)
}

/// Serve `responses` in order, one per connection; the last one repeats.
pub async fn serve(responses: Vec<Vec<u8>>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let reply = responses[n.min(responses.len() - 1)].clone();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            let _ = socket.write_all(&reply).await;
            let _ = socket.shutdown().await;
        }
    });

    (
        format!("http://{addr}/trip-data/yellow_tripdata_2021-01.parquet"),
        hits,
    )
}

/// A trip table with one row per fare; vendor ids count up from `first_id`.
pub fn trips(first_id: i64, fares: &[f64]) -> Table {
    let schema = Arc::new(Schema::new(vec![
        Field::new("VendorID", DataType::Int64, false),
        Field::new("total_amount", DataType::Float64, true),
    ]));
    let ids = Int64Array::from_iter_values(first_id..first_id + fares.len() as i64);
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(ids),
            Arc::new(Float64Array::from(fares.to_vec())),
        ],
    )
    .unwrap();
    Table::new(schema, vec![batch])
}

pub fn parquet_bytes(table: &Table) -> Vec<u8> {
    table::encode(table, ParquetCompression::Snappy)
        .unwrap()
        .to_vec()
}

/// Everything a local run touches, under one temp dir.
pub struct Deployment {
    pub dir: TempDir,
}

impl Deployment {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn bucket(&self) -> PathBuf {
        self.dir.path().join("bucket")
    }

    pub fn warehouse_dir(&self) -> PathBuf {
        self.dir.path().join("warehouse")
    }

    pub fn working_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn config(&self, url: &str) -> Config {
        let mut config = Config::default();
        config.source.url = url.to_string();
        config.source.timeout_secs = 5;
        config.source.max_retries = 0;
        config.source.retry_backoff_ms = 1;
        config.storage.bucket = self.bucket().display().to_string();
        config.warehouse = WarehouseConfig {
            poll_interval_ms: 10,
            job_timeout_secs: 5,
            backend: WarehouseBackend::Local(LocalWarehouseConfig {
                path: self.warehouse_dir(),
            }),
            ..WarehouseConfig::default()
        };
        config.working_dir = self.working_dir();
        config
    }

    /// Bytes stored in the bucket under `key`, if any.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.bucket().join(key)).ok()
    }

    pub async fn warehouse_table(&self) -> Option<Table> {
        let warehouse = LocalWarehouse::open(
            &self.warehouse_dir(),
            HashMap::new(),
            ParquetCompression::Snappy,
        )
        .await
        .unwrap();
        warehouse
            .read_table("data_pipeline", "yellow_taxi_trips")
            .await
            .unwrap()
    }
}
