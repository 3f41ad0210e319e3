//! Stem archive extraction
//!
//! The separation service returns a flat zip containing one file per stem.
//! A corrupt or empty archive is a permanent failure for that attempt - this
//! component performs no retries.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

/// Stem base names produced by the separation service.
///
/// Boundary assumption: fixed by the remote service's contract, with the
/// extension given by the requested output format.
pub const EXPECTED_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Archive missing, unreadable, or not a valid zip
    #[error("Failed to open archive {0}: {1}")]
    Open(PathBuf, String),

    /// Archive opened but contains no file entries
    #[error("Archive contains no entries: {0}")]
    Empty(PathBuf),

    /// An individual entry failed to unpack
    #[error("Failed to unpack entry {0}: {1}")]
    Unpack(String, String),

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Unpack `archive_path` into `dest_dir`, returning the written file paths.
///
/// Entry names are flattened to their final component so a single-level
/// archive lands directly in the destination directory.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = File::open(archive_path)
        .map_err(|e| ArchiveError::Open(archive_path.to_path_buf(), e.to_string()))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ArchiveError::Open(archive_path.to_path_buf(), e.to_string()))?;

    if archive.len() == 0 {
        return Err(ArchiveError::Empty(archive_path.to_path_buf()));
    }

    std::fs::create_dir_all(dest_dir)?;

    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ArchiveError::Unpack(format!("#{}", index), e.to_string()))?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        let file_name = match Path::new(&entry_name).file_name() {
            Some(name) => name.to_owned(),
            None => continue,
        };

        let out_path = dest_dir.join(&file_name);
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| ArchiveError::Unpack(entry_name, e.to_string()))?;
        written.push(out_path);
    }

    if written.is_empty() {
        return Err(ArchiveError::Empty(archive_path.to_path_buf()));
    }

    tracing::info!(
        archive = %archive_path.display(),
        files = written.len(),
        dest = %dest_dir.display(),
        "Archive extracted"
    );
    Ok(written)
}
