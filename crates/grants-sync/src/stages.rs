//! The five pipeline stages. Each takes the object store explicitly and
//! finishes all of its side effects before returning.

use chrono::NaiveDate;
use grants_core::OpportunityRecord;
use grants_extract::{extract_records, unpack_zip};
use grants_storage::{FeedClient, Storage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::dataset::{encode_parquet, materialize_records, DATASET_EXTENSION};
use crate::{FeedConfig, PipelineError, StoreLayout};

pub const ARCHIVE_EXTENSION: &str = ".zip";
pub const DOCUMENT_EXTENSION: &str = ".xml";

/// Delete every object under `prefix` whose key ends in one of `extensions`.
/// Returns the deleted keys. The first failing delete aborts the sweep.
pub async fn clear_artifacts(
    storage: &dyn Storage,
    prefix: &str,
    extensions: &[&str],
) -> Result<Vec<String>, PipelineError> {
    let doomed = storage
        .list(prefix)
        .await?
        .into_iter()
        .filter(|key| extensions.iter().any(|ext| key.ends_with(ext)))
        .collect::<Vec<_>>();

    for key in &doomed {
        storage.delete(key).await?;
        info!(key = %key, "deleted stale artifact");
    }
    Ok(doomed)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedArchive {
    pub key: String,
    /// URL the body was served from, after redirects.
    pub source_url: String,
    pub status: u16,
}

/// Retrieve the archive published for `run_date` and store it under the
/// archive prefix. Nothing is stored on failure.
pub async fn fetch_archive(
    storage: &dyn Storage,
    client: &dyn FeedClient,
    feed: &FeedConfig,
    layout: &StoreLayout,
    run_date: NaiveDate,
) -> Result<FetchedArchive, PipelineError> {
    let file_name = feed.file_name(run_date);
    let url = feed.url(run_date);

    let response = client
        .fetch_bytes(&url)
        .await
        .map_err(|source| PipelineError::RemoteFetch {
            url: url.clone(),
            source,
        })?;
    info!(
        url = %response.final_url,
        status = response.status.as_u16(),
        bytes = response.body.len(),
        "downloaded feed archive"
    );

    let key = layout.archive_key(&file_name);
    storage.put(&key, &response.body).await?;
    info!(key = %key, "stored feed archive");
    Ok(FetchedArchive {
        key,
        source_url: response.final_url,
        status: response.status.as_u16(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnpackReport {
    pub archives: Vec<String>,
    pub entries: Vec<String>,
}

/// Expand every stored archive into the unzip namespace, then delete the
/// archive. A corrupt archive stops the run and is left in place.
pub async fn unpack_archives(
    storage: &dyn Storage,
    layout: &StoreLayout,
) -> Result<UnpackReport, PipelineError> {
    let archives = storage
        .list(&layout.archive_prefix())
        .await?
        .into_iter()
        .filter(|key| key.ends_with(ARCHIVE_EXTENSION))
        .collect::<Vec<_>>();

    let mut report = UnpackReport::default();
    for archive_key in archives {
        let blob = storage.get(&archive_key).await?;
        let entries = unpack_zip(&blob).map_err(|source| PipelineError::ArchiveCorrupt {
            key: archive_key.clone(),
            source,
        })?;
        if entries.is_empty() {
            warn!(key = %archive_key, "archive holds no files");
        }

        for entry in entries {
            let key = layout.unpacked_key(&entry.name);
            storage.put(&key, &entry.bytes).await?;
            report.entries.push(key);
        }

        storage.delete(&archive_key).await?;
        info!(key = %archive_key, "processed and deleted archive");
        report.archives.push(archive_key);
    }
    Ok(report)
}

/// Pick the "most recent" document: the lexicographically greatest key
/// ending in `.xml`. Keys embed a `YYYYMMDD` token, so string order is
/// date order as long as the naming stays uniform.
pub fn select_latest_document(keys: &[String]) -> Option<&str> {
    keys.iter()
        .filter(|key| key.ends_with(DOCUMENT_EXTENSION))
        .max()
        .map(String::as_str)
}

/// Load and parse the most recent unpacked document.
pub async fn extract_latest_document(
    storage: &dyn Storage,
    layout: &StoreLayout,
) -> Result<(String, Vec<OpportunityRecord>), PipelineError> {
    let prefix = layout.unpacked_prefix();
    let keys = storage.list(&prefix).await?;
    let key = select_latest_document(&keys)
        .ok_or_else(|| PipelineError::MissingDocument {
            prefix: prefix.clone(),
        })?
        .to_string();

    let xml = storage.get(&key).await?;
    let records = extract_records(&xml).map_err(|source| PipelineError::Parse {
        key: key.clone(),
        source,
    })?;
    info!(key = %key, records = records.len(), "extracted opportunity records");
    Ok((key, records))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializedDataset {
    pub key: String,
    pub rows: usize,
    pub bytes: usize,
    pub sha256: String,
}

/// Normalize dates, encode the rows as Parquet and store the dataset under
/// its dated key.
pub async fn materialize_dataset(
    storage: &dyn Storage,
    layout: &StoreLayout,
    run_date: NaiveDate,
    records: &[OpportunityRecord],
) -> Result<MaterializedDataset, PipelineError> {
    let key = layout.dataset_key(run_date);
    debug_assert!(key.ends_with(DATASET_EXTENSION));

    let rows = materialize_records(records);
    let bytes = encode_parquet(&rows).map_err(|source| PipelineError::Materialize {
        key: key.clone(),
        source,
    })?;
    storage.put(&key, &bytes).await?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let dataset = MaterializedDataset {
        key,
        rows: rows.len(),
        bytes: bytes.len(),
        sha256: hex::encode(hasher.finalize()),
    };
    info!(key = %dataset.key, rows = dataset.rows, bytes = dataset.bytes, "dataset saved");
    Ok(dataset)
}
