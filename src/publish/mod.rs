//! Blob publisher: copies a local file to the bucket under a fixed key.
//!
//! Every publish is a plain overwrite of the key. There is no versioning or
//! conditional write, so publishing the same file twice stores the same bytes.

use bytes::Bytes;
use object_store::PutPayload;
use object_store::path::Path as ObjectPath;
use snafu::prelude::*;
use std::path::Path;
use tracing::info;

use crate::config::StorageConfig;
use crate::emit;
use crate::error::{PutSnafu, ReadLocalSnafu, StorageError, UploadError};
use crate::metrics::events::BytesUploaded;
use crate::storage::StorageProvider;

#[derive(Debug, Clone)]
pub struct Publisher {
    storage: StorageProvider,
}

impl Publisher {
    /// Connect to the configured bucket.
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let storage =
            StorageProvider::for_url_with_options(&config.bucket, config.storage_options.clone())
                .await?;
        Ok(Self::new(storage))
    }

    pub fn new(storage: StorageProvider) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }

    /// Upload `local_path` to `key` and return the object's `scheme://bucket/key` URI.
    pub async fn publish(&self, local_path: &Path, key: &str) -> Result<String, UploadError> {
        let content = tokio::fs::read(local_path).await.context(ReadLocalSnafu {
            path: local_path.display().to_string(),
        })?;
        let bytes = content.len() as u64;
        let path = ObjectPath::from(key);

        self.storage
            .put_parquet(&path, PutPayload::from(Bytes::from(content)))
            .await
            .context(PutSnafu { key })?;

        let uri = self.storage.object_uri(&path);
        emit!(BytesUploaded { bytes });
        info!(uri = %uri, bytes, "Published artifact");
        Ok(uri)
    }
}
