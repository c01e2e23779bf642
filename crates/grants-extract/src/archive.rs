//! Zip container expansion.

use std::io::{Cursor, Read};

use tracing::debug;
use zip::ZipArchive;

use crate::ExtractError;

/// One file carried inside an archive. `name` is the entry path relative to
/// the archive root, `/`-separated, with `.` segments removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Expand every file entry of a zip blob, in central-directory order.
/// Directory entries are skipped.
pub fn unpack_zip(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = normalize_entry_name(file.name())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|source| ExtractError::EntryRead {
                name: name.clone(),
                source,
            })?;
        debug!(entry = %name, bytes = data.len(), "unpacked archive entry");
        entries.push(ArchiveEntry { name, bytes: data });
    }

    Ok(entries)
}

/// Accept `./` prefixes and backslash separators; reject names that are
/// absolute or climb out of the archive root.
fn normalize_entry_name(raw: &str) -> Result<String, ExtractError> {
    let unsafe_name = || ExtractError::UnsafeEntryName {
        name: raw.to_string(),
    };

    let converted = raw.replace('\\', "/");
    if converted.starts_with('/') {
        return Err(unsafe_name());
    }

    let mut segments = Vec::new();
    for segment in converted.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop().ok_or_else(unsafe_name)?;
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(unsafe_name());
    }
    Ok(segments.join("/"))
}
