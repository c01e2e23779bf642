//! Object storage + HTTP fetch utilities for the grants pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "grants-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("invalid object key {key:?}")]
    InvalidKey { key: String },
    #[error("storage i/o failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key-addressed blob store shared by every pipeline stage.
///
/// Keys are `/`-separated. `list` returns keys in ascending lexicographic
/// order. Deleting a missing key succeeds.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Bucket backed by a local directory. Keys map to relative paths below the
/// root; writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    fn is_temp_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(".tmp")
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let io_err = |source| StorageError::Io {
            key: prefix.to_string(),
            source,
        };

        if !fs::try_exists(&self.root).await.map_err(io_err)? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(io_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
                let name = entry.file_name().to_string_lossy().to_string();
                let key = if dir_key.is_empty() {
                    name.clone()
                } else {
                    format!("{dir_key}/{name}")
                };
                let file_type = entry.file_type().await.map_err(io_err)?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if !Self::is_temp_name(&name) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        debug!(key, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-process bucket, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Single-attempt retrieval of a remote body.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

impl HttpFetcher {
    async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched body");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl FeedClient for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get_once(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_keys_that_escape_the_bucket() {
        for key in ["", "/abs", "a/../b", "a//b", "dir/", "a\\b", "./x"] {
            assert!(
                matches!(validate_key(key), Err(StorageError::InvalidKey { .. })),
                "{key:?} should be rejected"
            );
        }
        assert!(validate_key("GrantsDBExtract/unzip/GrantsDBExtract20240215v2.xml").is_ok());
    }

    #[tokio::test]
    async fn fs_storage_round_trips_nested_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsStorage::new(dir.path());

        store
            .put("GrantsDBExtract/unzip/a.xml", b"<a/>")
            .await
            .expect("put nested");
        store.put("GrantsExtract-20240101.parquet", b"PAR1").await.expect("put root");

        assert_eq!(store.get("GrantsDBExtract/unzip/a.xml").await.expect("get"), b"<a/>");
        assert_eq!(
            store.list("").await.expect("list all"),
            vec![
                "GrantsDBExtract/unzip/a.xml".to_string(),
                "GrantsExtract-20240101.parquet".to_string(),
            ]
        );
        assert_eq!(
            store.list("GrantsDBExtract/").await.expect("list prefix"),
            vec!["GrantsDBExtract/unzip/a.xml".to_string()]
        );
    }

    #[tokio::test]
    async fn fs_storage_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsStorage::new(dir.path());

        store.put("k/v.bin", b"one").await.expect("first put");
        store.put("k/v.bin", b"two").await.expect("second put");

        assert_eq!(store.get("k/v.bin").await.expect("get"), b"two");
        let names = std::fs::read_dir(dir.path().join("k"))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["v.bin".to_string()]);
    }

    #[tokio::test]
    async fn fs_storage_missing_root_lists_empty_and_delete_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FsStorage::new(dir.path().join("not-created-yet"));

        assert!(store.list("").await.expect("list").is_empty());
        store.delete("nothing/here.zip").await.expect("delete missing");
        assert!(matches!(
            store.get("nothing/here.zip").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_storage_lists_sorted_by_prefix() {
        let store = MemoryStorage::new();
        store.put("p/b.xml", b"b").await.expect("put");
        store.put("p/a.xml", b"a").await.expect("put");
        store.put("q/c.xml", b"c").await.expect("put");

        assert_eq!(
            store.list("p/").await.expect("list"),
            vec!["p/a.xml".to_string(), "p/b.xml".to_string()]
        );
        store.delete("p/a.xml").await.expect("delete");
        store.delete("p/a.xml").await.expect("delete again");
        assert_eq!(store.keys().await, vec!["p/b.xml".to_string(), "q/c.xml".to_string()]);
    }

    #[test]
    fn fetch_error_exposes_status() {
        let err = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test/x.zip".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "http status 404 for https://example.test/x.zip");
    }
}
