//! Grants extract pipeline orchestration.
//!
//! A run is strictly sequential: janitor, fetch, unpack, extract,
//! materialize. Every stage finishes its side effects in the shared object
//! store before the next one starts, and the first fatal error ends the run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use grants_extract::ExtractError;
use grants_storage::{
    FeedClient, FetchError, FsStorage, HttpClientConfig, HttpFetcher, Storage, StorageError,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod dataset;
pub mod filter;
pub mod stages;

pub use dataset::{load_latest_dataset, parse_feed_date, DatasetError, LoadedDataset};
pub use filter::{filter_closing_grants, DatasetInsights};
pub use stages::{FetchedArchive, MaterializedDataset, UnpackReport};

pub const CRATE_NAME: &str = "grants-sync";

/// Naming template of the upstream extract:
/// `<base_url><file_prefix><YYYYMMDD><file_suffix>.zip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub base_url: String,
    pub file_prefix: String,
    pub file_suffix: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://prod-grants-gov-chatbot.s3.amazonaws.com/extracts/".to_string(),
            file_prefix: "GrantsDBExtract".to_string(),
            file_suffix: "v2".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn file_name(&self, run_date: NaiveDate) -> String {
        format!(
            "{}{}{}.zip",
            self.file_prefix,
            run_date.format("%Y%m%d"),
            self.file_suffix
        )
    }

    pub fn url(&self, run_date: NaiveDate) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.file_name(run_date)
        )
    }
}

/// Key conventions inside the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub archive_dir: String,
    pub dataset_name: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            archive_dir: "GrantsDBExtract".to_string(),
            dataset_name: "GrantsExtract".to_string(),
        }
    }
}

impl StoreLayout {
    pub fn archive_prefix(&self) -> String {
        format!("{}/", self.archive_dir.trim_end_matches('/'))
    }

    pub fn archive_key(&self, file_name: &str) -> String {
        format!("{}{}", self.archive_prefix(), file_name)
    }

    pub fn unpacked_prefix(&self) -> String {
        format!("{}unzip/", self.archive_prefix())
    }

    pub fn unpacked_key(&self, entry_name: &str) -> String {
        format!("{}{}", self.unpacked_prefix(), entry_name)
    }

    pub fn dataset_key(&self, run_date: NaiveDate) -> String {
        format!(
            "{}-{}{}",
            self.dataset_name,
            run_date.format("%Y%m%d"),
            dataset::DATASET_EXTENSION
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bucket_dir: PathBuf,
    pub feed: FeedConfig,
    pub layout: StoreLayout,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bucket_dir: PathBuf::from("./bucket"),
            feed: FeedConfig::default(),
            layout: StoreLayout::default(),
            user_agent: "grants-etl/0.1".to_string(),
            http_timeout_secs: 120,
            scheduler_enabled: false,
            sync_cron: "0 0 12 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source; unset names keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bucket_dir: lookup("GRANTS_BUCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bucket_dir),
            feed: FeedConfig {
                base_url: lookup("GRANTS_FEED_BASE_URL").unwrap_or(defaults.feed.base_url),
                file_prefix: lookup("GRANTS_FEED_PREFIX").unwrap_or(defaults.feed.file_prefix),
                file_suffix: lookup("GRANTS_FEED_SUFFIX").unwrap_or(defaults.feed.file_suffix),
            },
            layout: StoreLayout {
                archive_dir: lookup("GRANTS_ARCHIVE_PREFIX").unwrap_or(defaults.layout.archive_dir),
                dataset_name: lookup("GRANTS_DATASET_NAME").unwrap_or(defaults.layout.dataset_name),
            },
            user_agent: lookup("GRANTS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("GRANTS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: lookup("GRANTS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: lookup("GRANTS_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    RemoteFetch,
    ArchiveCorrupt,
    Parse,
    MissingDocument,
    Storage,
    Materialize,
}

/// Fatal pipeline failures. Malformed dates are not here: they become nulls.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetching {url} failed: {source}")]
    RemoteFetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("archive {key} is corrupt: {source}")]
    ArchiveCorrupt {
        key: String,
        #[source]
        source: ExtractError,
    },
    #[error("document {key} could not be parsed: {source}")]
    Parse {
        key: String,
        #[source]
        source: ExtractError,
    },
    #[error("no xml document found under {prefix}")]
    MissingDocument { prefix: String },
    #[error("object store: {0}")]
    Storage(#[from] StorageError),
    #[error("writing dataset {key} failed: {source}")]
    Materialize {
        key: String,
        #[source]
        source: DatasetError,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::RemoteFetch { .. } => ErrorKind::RemoteFetch,
            PipelineError::ArchiveCorrupt { .. } => ErrorKind::ArchiveCorrupt,
            PipelineError::Parse { .. } => ErrorKind::Parse,
            PipelineError::MissingDocument { .. } => ErrorKind::MissingDocument,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::Materialize { .. } => ErrorKind::Materialize,
        }
    }

    /// Upstream HTTP status, when the run died on a non-success response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PipelineError::RemoteFetch { source, .. } => source.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deleted_artifacts: usize,
    pub archive_key: String,
    pub archive_url: String,
    pub archive_status: u16,
    pub unpacked_entries: usize,
    pub document_key: String,
    pub records: usize,
    pub dataset_key: String,
    pub dataset_bytes: usize,
    pub dataset_sha256: String,
}

#[derive(Clone)]
pub struct GrantsPipeline {
    config: SyncConfig,
    storage: Arc<dyn Storage>,
    feed: Arc<dyn FeedClient>,
}

impl GrantsPipeline {
    /// Filesystem bucket + real HTTP client, both taken from `config`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let storage = Arc::new(FsStorage::new(config.bucket_dir.clone()));
        let feed = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?);
        Ok(Self::with_parts(config, storage, feed))
    }

    pub fn with_parts(
        config: SyncConfig,
        storage: Arc<dyn Storage>,
        feed: Arc<dyn FeedClient>,
    ) -> Self {
        Self {
            config,
            storage,
            feed,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run against today's local calendar date.
    pub async fn run_once(&self) -> Result<PipelineRunSummary, PipelineError> {
        self.run_for_date(Local::now().date_naive()).await
    }

    pub async fn run_for_date(
        &self,
        run_date: NaiveDate,
    ) -> Result<PipelineRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("grants_run", %run_id, %run_date);
        self.run_stages(run_id, run_date).instrument(span).await
    }

    /// Delete stale intermediate and dataset artifacts without running the
    /// rest of the pipeline.
    pub async fn clean(&self) -> Result<Vec<String>, PipelineError> {
        let storage = self.storage.as_ref();
        let mut deleted = stages::clear_artifacts(
            storage,
            &self.config.layout.archive_prefix(),
            &[stages::ARCHIVE_EXTENSION, stages::DOCUMENT_EXTENSION],
        )
        .await?;
        deleted.extend(
            stages::clear_artifacts(storage, "", &[dataset::DATASET_EXTENSION]).await?,
        );
        Ok(deleted)
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        run_date: NaiveDate,
    ) -> Result<PipelineRunSummary, PipelineError> {
        let started_at = Utc::now();
        let storage = self.storage.as_ref();
        let layout = &self.config.layout;

        let deleted = self.clean().await?;
        info!(deleted = deleted.len(), "janitor finished");

        let archive =
            stages::fetch_archive(storage, self.feed.as_ref(), &self.config.feed, layout, run_date)
                .await?;

        let unpacked = stages::unpack_archives(storage, layout).await?;
        info!(
            archives = unpacked.archives.len(),
            entries = unpacked.entries.len(),
            "unpack finished"
        );

        let (document_key, records) = stages::extract_latest_document(storage, layout).await?;
        let dataset = stages::materialize_dataset(storage, layout, run_date, &records).await?;

        Ok(PipelineRunSummary {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            deleted_artifacts: deleted.len(),
            archive_key: archive.key,
            archive_url: archive.source_url,
            archive_status: archive.status,
            unpacked_entries: unpacked.entries.len(),
            document_key,
            records: records.len(),
            dataset_key: dataset.key,
            dataset_bytes: dataset.bytes,
            dataset_sha256: dataset.sha256,
        })
    }

    /// Cron-driven full runs. `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.clone();
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        records = summary.records,
                        dataset = %summary.dataset_key,
                        "scheduled run complete"
                    ),
                    Err(err) => error!(kind = ?err.kind(), error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn feed_url_follows_naming_template() {
        let feed = FeedConfig::default();
        assert_eq!(feed.file_name(ymd(2024, 2, 15)), "GrantsDBExtract20240215v2.zip");
        assert_eq!(
            feed.url(ymd(2024, 2, 15)),
            "https://prod-grants-gov-chatbot.s3.amazonaws.com/extracts/GrantsDBExtract20240215v2.zip"
        );

        let no_slash = FeedConfig {
            base_url: "http://localhost:9000/extracts".into(),
            ..FeedConfig::default()
        };
        assert_eq!(
            no_slash.url(ymd(2025, 1, 5)),
            "http://localhost:9000/extracts/GrantsDBExtract20250105v2.zip"
        );
    }

    #[test]
    fn layout_keys() {
        let layout = StoreLayout::default();
        assert_eq!(
            layout.archive_key("GrantsDBExtract20240215v2.zip"),
            "GrantsDBExtract/GrantsDBExtract20240215v2.zip"
        );
        assert_eq!(
            layout.unpacked_key("GrantsDBExtract20240215v2.xml"),
            "GrantsDBExtract/unzip/GrantsDBExtract20240215v2.xml"
        );
        assert_eq!(layout.dataset_key(ymd(2024, 12, 31)), "GrantsExtract-20241231.parquet");
    }

    #[test]
    fn config_reads_overrides_and_keeps_defaults() {
        let vars = HashMap::from([
            ("GRANTS_BUCKET_DIR", "/data/grantsgov"),
            ("GRANTS_DATASET_NAME", "Opps"),
            ("GRANTS_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("GRANTS_SCHEDULER_ENABLED", "true"),
        ]);
        let config = SyncConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.bucket_dir, PathBuf::from("/data/grantsgov"));
        assert_eq!(config.layout.dataset_name, "Opps");
        assert_eq!(config.layout.archive_dir, "GrantsDBExtract");
        assert_eq!(config.http_timeout_secs, 120);
        assert!(config.scheduler_enabled);
        assert_eq!(config.feed, FeedConfig::default());
    }

    #[test]
    fn error_kinds_and_status() {
        let err = PipelineError::RemoteFetch {
            url: "u".into(),
            source: FetchError::HttpStatus {
                status: 404,
                url: "u".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::RemoteFetch);
        assert_eq!(err.http_status(), Some(404));

        let err = PipelineError::MissingDocument {
            prefix: "GrantsDBExtract/unzip/".into(),
        };
        assert_eq!(err.kind(), ErrorKind::MissingDocument);
        assert_eq!(err.http_status(), None);
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let pipeline = GrantsPipeline::with_parts(
            SyncConfig::default(),
            Arc::new(grants_storage::MemoryStorage::new()),
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client")),
        );
        assert!(pipeline.maybe_build_scheduler().await.expect("build").is_none());
    }
}
