//! Download and install a platform build of `cdswctl`.
//!
//! Each attempt gets its own random directory under the configured root, so
//! concurrent installs never write to the same path. Nothing here retries:
//! a failed attempt is reported and the caller decides whether to try again
//! with a fresh workspace.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError};
use crate::fetch::{CaTrust, Fetch, FetchError, HttpFetcher};
use crate::platform::{ArchiveFormat, DownloadTarget, Os, resolve_download_url};
use crate::workspace::InstallWorkspace;

/// Errors from resolving, downloading or installing `cdswctl`.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Invalid download URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Download failed: {0}")]
    Transport(#[from] FetchError),

    #[error("Install directory {dir} is not inside the install root {root}")]
    Validation { dir: PathBuf, root: PathBuf },

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Failed to {op} {path}: {source}")]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl InstallError {
    pub(crate) fn fs(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An installed `cdswctl` executable. Always located inside the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    path: PathBuf,
}

impl InstalledBinary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for InstalledBinary {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Installs `cdswctl` builds under a fixed root directory.
#[derive(Debug, Clone)]
pub struct Installer<F = HttpFetcher> {
    root: PathBuf,
    fetcher: F,
}

impl Installer<HttpFetcher> {
    /// Installer downloading over HTTPS.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_fetcher(root, HttpFetcher)
    }
}

impl<F: Fetch> Installer<F> {
    pub fn with_fetcher(root: impl Into<PathBuf>, fetcher: F) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh per-attempt directory under the root.
    pub fn create_workspace(&self) -> Result<InstallWorkspace, InstallError> {
        let workspace = InstallWorkspace::generate(&self.root);
        workspace.create()?;
        Ok(workspace)
    }

    /// Resolve the build for this platform and install it.
    pub async fn obtain(&self, host: &str, ca: &CaTrust) -> Result<InstalledBinary, InstallError> {
        let target = resolve_download_url(host, Os::current())?;
        let binary = self.fetch_and_install(&target, ca).await?;
        info!(path = %binary.path().display(), "Installed cdswctl");
        Ok(binary)
    }

    /// Download `target` into a new workspace and install the binary there.
    pub async fn fetch_and_install(
        &self,
        target: &DownloadTarget,
        ca: &CaTrust,
    ) -> Result<InstalledBinary, InstallError> {
        let workspace = self.create_workspace()?;
        self.install_into(&workspace, target, ca).await
    }

    /// Download `target` into an existing workspace and install the binary.
    ///
    /// The workspace must resolve to a directory strictly inside the root;
    /// otherwise nothing is extracted. The downloaded archive is removed
    /// whether or not extraction succeeds.
    pub async fn install_into(
        &self,
        workspace: &InstallWorkspace,
        target: &DownloadTarget,
        ca: &CaTrust,
    ) -> Result<InstalledBinary, InstallError> {
        let file_name = target.file_name().ok_or_else(|| InstallError::InvalidUrl {
            url: target.url.to_string(),
            reason: "URL has no file name".into(),
        })?;
        let archive_path = workspace.dir().join(file_name);

        let unpacked = match self.fetcher.fetch(&target.url, &archive_path, ca).await {
            Ok(bytes) => {
                debug!(archive = %archive_path.display(), bytes, "Fetched archive");
                unpack(workspace, target.format, &archive_path).await
            }
            Err(e) => Err(e.into()),
        };
        let removed = remove_archive(&archive_path);

        let dir = match unpacked {
            Ok(dir) => dir,
            Err(e) => {
                if let Err(cleanup) = removed {
                    warn!(error = %cleanup, "Failed to remove archive after failed install");
                }
                return Err(e);
            }
        };
        removed?;

        let binary = relocate_binary(&dir)?;
        let path = std::fs::canonicalize(&binary)
            .map_err(|source| InstallError::fs("resolve path", &binary, source))?;
        let root = std::fs::canonicalize(&self.root)
            .map_err(|source| InstallError::fs("resolve path", &self.root, source))?;
        if !path.starts_with(&root) {
            return Err(InstallError::Validation { dir: path, root });
        }
        Ok(InstalledBinary { path: binary })
    }
}

/// Check the workspace location, then extract. Returns the canonical dir.
async fn unpack(
    workspace: &InstallWorkspace,
    format: ArchiveFormat,
    archive_path: &Path,
) -> Result<PathBuf, InstallError> {
    let dir = workspace.verify_within_root()?;
    archive::extract(format, archive_path, &dir).await?;
    Ok(dir)
}

fn remove_archive(path: &Path) -> Result<(), InstallError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(InstallError::fs("remove archive", path, source)),
    }
}

/// Move `<dir>/<top>/cdswctl` to `<dir>/cdswctl` and drop `<dir>/<top>`.
fn relocate_binary(dir: &Path) -> Result<PathBuf, InstallError> {
    let name = crate::binary_name();
    let top = archive::single_top_level_dir(dir)?;
    let extracted = top.join(&name);
    if !extracted.is_file() {
        return Err(ArchiveError::MissingBinary { path: extracted }.into());
    }

    // Staged under a temporary name in case the top-level directory is itself
    // called `cdswctl`.
    let staged = dir.join(format!(".{name}.partial"));
    let final_path = dir.join(&name);
    std::fs::rename(&extracted, &staged)
        .map_err(|source| InstallError::fs("move binary", &extracted, source))?;
    std::fs::remove_dir_all(&top)
        .map_err(|source| InstallError::fs("remove directory", &top, source))?;
    std::fs::rename(&staged, &final_path)
        .map_err(|source| InstallError::fs("move binary", &staged, source))?;
    make_executable(&final_path)?;

    debug!(path = %final_path.display(), "Relocated cdswctl");
    Ok(final_path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|source| InstallError::fs("set permissions on", path, source))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}
