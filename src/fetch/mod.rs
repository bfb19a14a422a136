//! Source download.
//!
//! One GET against the source URL, retried with exponential backoff on
//! transport errors, 5xx and 429. Only `200 OK` counts as success; the body is
//! streamed to `<destination>.part` and renamed over the destination once
//! complete, so a failed download never replaces a good file with a truncated
//! one.

use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::emit;
use crate::error::{ClientSnafu, FetchError};
use crate::metrics::events::{BytesDownloaded, FetchAttempt, FetchOutcome};

/// Upper bound on the exponent used for backoff.
const MAX_BACKOFF_SHIFT: u32 = 10;

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_retries: u32,
    backoff: Duration,
}

/// Why a single attempt failed.
enum AttemptError {
    Transport(reqwest::Error),
    Status(StatusCode),
    Write(std::io::Error),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(_) => true,
            AttemptError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            AttemptError::Write(_) => false,
        }
    }

    fn into_fetch_error(self, url: &str, destination: &Path, attempts: u32) -> FetchError {
        match self {
            AttemptError::Transport(source) => FetchError::Request {
                url: url.to_string(),
                attempts,
                source,
            },
            AttemptError::Status(status) => FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                attempts,
            },
            AttemptError::Write(source) => FetchError::Write {
                path: destination.display().to_string(),
                source,
            },
        }
    }
}

impl Fetcher {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context(ClientSnafu)?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        })
    }

    /// Download `url` to `destination` and return the destination path.
    pub async fn fetch(&self, url: &str, destination: &Path) -> Result<PathBuf, FetchError> {
        let part = part_path(destination);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(url, attempt, "Requesting source file");

            let err = match self.try_fetch(url, destination, &part).await {
                Ok(bytes) => {
                    emit!(FetchAttempt {
                        outcome: FetchOutcome::Success
                    });
                    emit!(BytesDownloaded { bytes });
                    info!(url, bytes, path = %destination.display(), "Downloaded source file");
                    return Ok(destination.to_path_buf());
                }
                Err(err) => err,
            };

            let _ = tokio::fs::remove_file(&part).await;

            if err.is_retryable() && attempt <= self.max_retries {
                emit!(FetchAttempt {
                    outcome: FetchOutcome::Retryable
                });
                let delay = backoff_delay(self.backoff, attempt);
                let reason = err.into_fetch_error(url, destination, attempt);
                warn!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Source download failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            emit!(FetchAttempt {
                outcome: FetchOutcome::Fatal
            });
            return Err(err.into_fetch_error(url, destination, attempt));
        }
    }

    async fn try_fetch(&self, url: &str, destination: &Path, part: &Path) -> Result<u64, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(AttemptError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AttemptError::Status(status));
        }

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(AttemptError::Write)?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(AttemptError::Transport)?;
            file.write_all(&chunk).await.map_err(AttemptError::Write)?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(AttemptError::Write)?;
        drop(file);

        tokio::fs::rename(part, destination)
            .await
            .map_err(AttemptError::Write)?;
        Ok(written)
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// `base * 2^(attempt - 1)` plus up to `base` of random jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    let exponential = base.saturating_mul(1 << shift);
    let base_ms = base.as_millis() as u64;
    let jitter = if base_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..base_ms))
    } else {
        Duration::ZERO
    };
    exponential + jitter
}
