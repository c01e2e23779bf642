//! Archive unpacking + XML record extraction for the grants feed.

use thiserror::Error;

pub mod archive;
pub mod synopsis;

pub use archive::{unpack_zip, ArchiveEntry};
pub use synopsis::{extract_records, OPPORTUNITY_NAMESPACE, SYNOPSIS_TAG};

pub const CRATE_NAME: &str = "grants-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive is not a readable zip: {0}")]
    ArchiveCorrupt(#[from] zip::result::ZipError),
    #[error("archive entry {name} could not be read: {source}")]
    EntryRead {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive entry {name} escapes the archive root")]
    UnsafeEntryName { name: String },
    #[error("document is not valid utf-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed xml: {0}")]
    Xml(#[from] roxmltree::Error),
}

impl ExtractError {
    /// True when the failure came from the zip container rather than the
    /// document inside it.
    pub fn is_archive_error(&self) -> bool {
        matches!(
            self,
            ExtractError::ArchiveCorrupt(_)
                | ExtractError::EntryRead { .. }
                | ExtractError::UnsafeEntryName { .. }
        )
    }
}
