//! Bucket URL parsing.
//!
//! Recognised forms:
//! - GCS: `gs://bucket[/key]`, `https://storage.googleapis.com/bucket[/key]`
//! - S3: `s3://bucket[/key]`, `s3::http://host:port/bucket[/key]`
//! - local: `file:///dir`, `file:/dir`, `/dir`

use object_store::path::Path;
use regex::{Captures, Regex};
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig, S3Config};

#[derive(Debug, Clone, Copy)]
enum Backend {
    Gcs,
    S3,
    Local,
}

static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::Gcs, r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$"),
        (
            Backend::Gcs,
            r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$",
        ),
        (
            Backend::S3,
            r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
        ),
        (Backend::S3, r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$"),
        (Backend::Local, r"^file://(?P<path>.*)$"),
        (Backend::Local, r"^file:(?P<path>.*)$"),
        (Backend::Local, r"^(?P<path>/.*)$"),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("storage URL regex is valid")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// With `with_key`, a local path is split into its parent directory and
    /// file name; cloud URLs always carry everything after the bucket as key.
    pub fn parse_url(url: &str, with_key: bool) -> Result<Self, StorageError> {
        let found = MATCHERS
            .iter()
            .find_map(|(backend, re)| re.captures(url).map(|caps| (*backend, caps)));

        match found {
            Some((Backend::Gcs, caps)) => Ok(Self::parse_gcs(&caps)),
            Some((Backend::S3, caps)) => Ok(Self::parse_s3(&caps)),
            Some((Backend::Local, caps)) => Self::parse_local(url, &caps, with_key),
            None => InvalidUrlSnafu {
                url: url.to_string(),
            }
            .fail(),
        }
    }

    fn parse_gcs(caps: &Captures) -> Self {
        BackendConfig::Gcs(GcsConfig {
            bucket: caps["bucket"].to_string(),
            key: caps.name("key").map(|m| m.as_str().into()),
        })
    }

    fn parse_s3(caps: &Captures) -> Self {
        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|host| {
                let protocol = caps.name("protocol").map_or("https", |p| p.as_str());
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                format!("{protocol}://{}:{port}", host.as_str())
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region: std::env::var("AWS_DEFAULT_REGION").ok(),
            bucket: caps["bucket"].to_string(),
            key: caps.name("key").map(|m| m.as_str().into()),
        })
    }

    fn parse_local(url: &str, caps: &Captures, with_key: bool) -> Result<Self, StorageError> {
        let raw = &caps["path"];
        let mut path = if raw.starts_with('/') {
            PathBuf::from(raw)
        } else {
            PathBuf::from(format!("/{raw}"))
        };

        let key = if with_key {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| Path::from(n.to_string()));
            path.pop();
            name
        } else {
            None
        };

        let path = path.to_str().map(str::to_string).ok_or_else(|| {
            InvalidUrlSnafu {
                url: url.to_string(),
            }
            .build()
        })?;

        Ok(BackendConfig::Local(LocalConfig { path, key }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
        }
    }

    pub(crate) fn take_key(&mut self) -> Option<Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.take(),
            BackendConfig::Gcs(gcs) => gcs.key.take(),
            BackendConfig::Local(local) => local.key.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcs_bucket_url() {
        let config =
            BackendConfig::parse_url("gs://data-pipeline-parquet-teak-gamma-442315-f8", false)
                .unwrap();
        assert_eq!(
            config,
            BackendConfig::Gcs(GcsConfig {
                bucket: "data-pipeline-parquet-teak-gamma-442315-f8".to_string(),
                key: None,
            })
        );
    }

    #[test]
    fn test_gcs_object_url() {
        match BackendConfig::parse_url("gs://bucket/processed/trips.parquet", true).unwrap() {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "bucket");
                assert_eq!(gcs.key, Some(Path::from("processed/trips.parquet")));
            }
            other => panic!("Expected Gcs config, got {other:?}"),
        }
    }

    #[test]
    fn test_gcs_path_style_url() {
        match BackendConfig::parse_url("https://storage.googleapis.com/bucket/raw", false).unwrap()
        {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "bucket");
                assert_eq!(gcs.key, Some(Path::from("raw")));
            }
            other => panic!("Expected Gcs config, got {other:?}"),
        }
    }

    #[test]
    fn test_s3_url() {
        match BackendConfig::parse_url("s3://trips/raw_data", false).unwrap() {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "trips");
                assert_eq!(s3.key, Some(Path::from("raw_data")));
            }
            other => panic!("Expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_s3_endpoint_url() {
        match BackendConfig::parse_url("s3::http://localhost:9000/trips", false).unwrap() {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "trips");
                assert_eq!(s3.endpoint, Some("http://localhost:9000".to_string()));
                assert_eq!(s3.key, None);
            }
            other => panic!("Expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_local_forms() {
        for url in ["/srv/bucket", "file:///srv/bucket", "file:/srv/bucket"] {
            match BackendConfig::parse_url(url, false).unwrap() {
                BackendConfig::Local(local) => {
                    assert_eq!(local.path, "/srv/bucket");
                    assert_eq!(local.key, None);
                }
                other => panic!("Expected Local config for {url}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_local_with_key_splits_file_name() {
        match BackendConfig::parse_url("file:///srv/bucket/raw_data/trips.parquet", true).unwrap()
        {
            BackendConfig::Local(local) => {
                assert_eq!(local.path, "/srv/bucket/raw_data");
                assert_eq!(local.key, Some(Path::from("trips.parquet")));
            }
            other => panic!("Expected Local config, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_url() {
        assert!(BackendConfig::parse_url("ftp://example.com/x", false).is_err());
        assert!(BackendConfig::parse_url("relative/dir", false).is_err());
    }
}
