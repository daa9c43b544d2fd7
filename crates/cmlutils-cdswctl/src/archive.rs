//! Archive extraction and layout checks for downloaded `cdswctl` builds.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::debug;

use crate::platform::ArchiveFormat;

/// Errors reading or unpacking a downloaded archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to extract {format} archive {path}: {reason}")]
    Extract {
        path: PathBuf,
        format: ArchiveFormat,
        reason: String,
    },

    #[error("Expected exactly one top-level directory in {dir}, found {entries:?}")]
    UnexpectedLayout { dir: PathBuf, entries: Vec<String> },

    #[error("Archive does not contain the cdswctl binary at {path}")]
    MissingBinary { path: PathBuf },

    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// Unpack `archive_path` into `dest_dir` on the blocking thread pool.
pub async fn extract(
    format: ArchiveFormat,
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<(), ArchiveError> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(format, &archive_path, &dest_dir))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

/// Unpack an archive synchronously.
///
/// Both readers refuse entries that would land outside `dest_dir`.
pub fn extract_blocking(
    format: ArchiveFormat,
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<(), ArchiveError> {
    debug!(
        archive = %archive_path.display(),
        dest = %dest_dir.display(),
        %format,
        "Extracting archive"
    );
    let file = File::open(archive_path).map_err(|source| ArchiveError::Open {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let extract_err = |reason: String| ArchiveError::Extract {
        path: archive_path.to_path_buf(),
        format,
        reason,
    };

    match format {
        ArchiveFormat::TarGz => {
            let mut archive = Archive::new(GzDecoder::new(file));
            archive
                .unpack(dest_dir)
                .map_err(|e| extract_err(e.to_string()))?;
        }
        ArchiveFormat::Zip => {
            let mut archive =
                zip::ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;
            archive
                .extract(dest_dir)
                .map_err(|e| extract_err(e.to_string()))?;
        }
    }
    Ok(())
}

/// Return the only entry of `dir`, which must be a directory.
pub fn single_top_level_dir(dir: &Path) -> Result<PathBuf, ArchiveError> {
    let open_err = |source| ArchiveError::Open {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(open_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<PathBuf>>>()
        .map_err(open_err)?;
    entries.sort();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Err(ArchiveError::UnexpectedLayout {
            dir: dir.to_path_buf(),
            entries: entries
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
        }),
    }
}
