//! Object storage access for the published artifacts.
//!
//! Wraps `object_store` behind one `StorageProvider` for GCS, S3 and the local
//! filesystem, so the publisher and the local warehouse never branch on the
//! backend themselves.

mod gcs;
mod local;
mod s3;
mod url_parser;

pub use url_parser::BackendConfig;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;

const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url, false)?;
        Self::from_config(config, options).await
    }

    /// Open the store holding a single object and return the object's path in it.
    ///
    /// Accepts the URIs returned by [`StorageProvider::object_uri`].
    pub async fn for_object_uri(
        uri: &str,
        options: HashMap<String, String>,
    ) -> Result<(Self, Path), StorageError> {
        let mut config = BackendConfig::parse_url(uri, true)?;
        let key = config
            .take_key()
            .context(InvalidUrlSnafu { url: uri.to_string() })?;
        let provider = Self::from_config(config, options).await?;
        Ok((provider, key))
    }

    async fn from_config(
        config: BackendConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Addressable URI of the object at `path`, e.g. `gs://bucket/raw_data/file.parquet`.
    pub fn object_uri(&self, path: &Path) -> String {
        let qualified = self.qualify_path(path);
        match &self.config {
            BackendConfig::Gcs(gcs) => format!("gs://{}/{}", gcs.bucket, qualified),
            BackendConfig::S3(s3) => format!("s3://{}/{}", s3.bucket, qualified),
            BackendConfig::Local(local) => {
                format!("file://{}/{}", local.path.trim_end_matches('/'), qualified)
            }
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = match self.object_store.get(&path).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        record(StorageOperation::Get, start, &result);
        result.context(ObjectStoreSnafu)
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, payload, PutOptions::default())
            .await
    }

    /// Put a Parquet file to a path with the correct content type.
    ///
    /// Local filesystem doesn't support attributes, so they are skipped there.
    pub async fn put_parquet(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        if matches!(self.config, BackendConfig::Local(_)) {
            return self.put_payload(path, payload).await;
        }

        let opts = PutOptions {
            attributes: Attributes::from_iter([(
                Attribute::ContentType,
                AttributeValue::from(PARQUET_CONTENT_TYPE),
            )]),
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record(StorageOperation::Put, start, &result);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Write `payload` to `{path}.tmp`, then rename it over `path`.
    ///
    /// Readers of `path` see either the old object or the new one, never a
    /// partial write.
    pub async fn atomic_put(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put_payload(&temp_path, payload).await?;
        self.rename(&temp_path, path).await
    }

    /// Server-side rename; `std::fs::rename` on the local filesystem.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from = self.qualify_path(from);
        let to = self.qualify_path(to);
        let start = Instant::now();
        let result = self.object_store.rename(&from, &to).await;
        record(StorageOperation::Rename, start, &result);
        result.context(ObjectStoreSnafu)
    }
}

fn record<T>(operation: StorageOperation, start: Instant, result: &object_store::Result<T>) {
    let status = if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}
