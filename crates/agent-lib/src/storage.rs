//! Incident record persistence
//!
//! Records are written once per incident under a deterministic key
//! (see [`IncidentRecord::storage_key`]). Two backends exist: a filesystem
//! sink for local or network mounts, and an object-store sink speaking plain
//! HTTP PUT to an S3-compatible endpoint.

use crate::models::IncidentRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default base directory of the filesystem sink
pub const DEFAULT_FS_BASE: &str = "/var/log/auto-agent";

/// Where object-store records land when no bucket is configured
pub const OBJECT_STORE_FALLBACK_DIR: &str = "/var/log/auto-agent/s3mirror";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store returned {status} for {key}")]
    Rejected { status: u16, key: String },
}

/// Destination for incident records
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Persist the record under `key`, returning its location (path or URL)
    async fn save(&self, key: &str, record: &IncidentRecord) -> Result<String, StorageError>;
}

/// Backend selection, as configured by `LOG_STORE` and friends
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    /// `efs`, `fs` or `s3`; anything else means filesystem
    pub store: String,
    pub fs_path: String,
    pub bucket: String,
    pub prefix: String,
    pub endpoint: String,
}

/// Build the configured sink.
///
/// An object store without a bucket degrades to the filesystem sink under
/// [`OBJECT_STORE_FALLBACK_DIR`].
pub fn sink_from_settings(settings: &StorageSettings) -> Result<Box<dyn StorageSink>, StorageError> {
    match settings.store.as_str() {
        "s3" if !settings.bucket.is_empty() => Ok(Box::new(ObjectStoreSink::new(
            &settings.endpoint,
            &settings.bucket,
            &settings.prefix,
        )?)),
        "s3" => {
            warn!(
                fallback = OBJECT_STORE_FALLBACK_DIR,
                "Object store selected without a bucket, writing records locally"
            );
            Ok(Box::new(FsSink::new(OBJECT_STORE_FALLBACK_DIR)))
        }
        _ => Ok(Box::new(FsSink::new(&settings.fs_path))),
    }
}

/// Writes `<base>/<key>.json`
#[derive(Debug, Clone)]
pub struct FsSink {
    base: PathBuf,
}

impl FsSink {
    /// An empty base selects [`DEFAULT_FS_BASE`]
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let base = if base.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_FS_BASE)
        } else {
            base.to_path_buf()
        };
        Self { base }
    }
}

#[async_trait]
impl StorageSink for FsSink {
    async fn save(&self, key: &str, record: &IncidentRecord) -> Result<String, StorageError> {
        let body = serde_json::to_vec_pretty(record)?;
        let path = self.base.join(format!("{key}.json"));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Persisted incident record");
        Ok(path.display().to_string())
    }
}

/// PUTs `<endpoint>/<bucket>/<prefix>/<key>.json`, path-style
#[derive(Debug, Clone)]
pub struct ObjectStoreSink {
    endpoint: String,
    bucket: String,
    prefix: String,
    http: reqwest::Client,
}

impl ObjectStoreSink {
    pub fn new(endpoint: &str, bucket: &str, prefix: &str) -> Result<Self, StorageError> {
        let endpoint = if endpoint.is_empty() {
            "https://s3.amazonaws.com"
        } else {
            endpoint
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            http,
        })
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("{key}.json")
        } else {
            format!("{}/{key}.json", self.prefix)
        }
    }
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    async fn save(&self, key: &str, record: &IncidentRecord) -> Result<String, StorageError> {
        let object_key = self.object_key(key);
        let body = serde_json::to_vec_pretty(record)?;

        let response = self
            .http
            .put(format!("{}/{}/{}", self.endpoint, self.bucket, object_key))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Rejected {
                status: response.status().as_u16(),
                key: object_key,
            });
        }

        Ok(format!("s3://{}/{}", self.bucket, object_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncidentReason;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record() -> IncidentRecord {
        IncidentRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            namespace: "ns1".to_string(),
            workload: "deployment-x".to_string(),
            pod: "p1".to_string(),
            container: "c1".to_string(),
            node: "n1".to_string(),
            reason: IncidentReason::OomKilled,
            message: "Container OOMKilled".to_string(),
            last_logs: "out of memory".to_string(),
            events: vec!["Warning OOMKilling: killed".to_string()],
            extras: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_fs_sink_writes_pretty_json_under_key() {
        let dir = TempDir::new().unwrap();
        let sink = FsSink::new(dir.path());
        let record = record();

        let location = sink.save(&record.storage_key(), &record).await.unwrap();

        let expected = dir.path().join("ns1/deployment-x/OOMKilled/2024-05-01/p1.json");
        assert_eq!(location, expected.display().to_string());
        let written = std::fs::read_to_string(&expected).unwrap();
        assert!(written.contains("\n  \"lastLogs\": \"out of memory\""));
    }

    #[tokio::test]
    async fn test_fs_sink_overwrites_same_key() {
        let dir = TempDir::new().unwrap();
        let sink = FsSink::new(dir.path());
        let mut record = record();

        sink.save("k", &record).await.unwrap();
        record.message = "second".to_string();
        sink.save("k", &record).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("k.json")).unwrap();
        assert!(written.contains("second"));
    }

    #[tokio::test]
    async fn test_fs_sink_reports_unwritable_base() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = FsSink::new(&blocker);

        let err = sink.save("a/b", &record()).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[test]
    fn test_empty_base_uses_default() {
        let sink = FsSink::new("");
        assert_eq!(sink.base, PathBuf::from(DEFAULT_FS_BASE));
    }

    #[tokio::test]
    async fn test_object_store_put() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/incidents/audit/ns1/deployment-x/OOMKilled/2024-05-01/p1.json")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        let sink = ObjectStoreSink::new(&server.url(), "incidents", "/audit/").unwrap();
        let record = record();
        let location = sink.save(&record.storage_key(), &record).await.unwrap();

        assert_eq!(
            location,
            "s3://incidents/audit/ns1/deployment-x/OOMKilled/2024-05-01/p1.json"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_object_store_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", mockito::Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let sink = ObjectStoreSink::new(&server.url(), "incidents", "").unwrap();
        let err = sink.save("k", &record()).await.unwrap_err();
        assert!(matches!(err, StorageError::Rejected { status: 403, .. }));
    }

    #[test]
    fn test_settings_select_backend() {
        let fallback = StorageSettings {
            store: "s3".to_string(),
            ..Default::default()
        };
        assert!(sink_from_settings(&fallback).is_ok());

        let fs = StorageSettings {
            store: "efs".to_string(),
            fs_path: "/tmp/incidents".to_string(),
            ..Default::default()
        };
        assert!(sink_from_settings(&fs).is_ok());
    }
}
