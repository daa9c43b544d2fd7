//! Per-attempt install directories under the shared root.

use std::path::{Path, PathBuf};

use crate::installer::InstallError;

/// Length of the random directory name for each install attempt.
pub const SESSION_ID_LEN: usize = 10;

/// One install attempt's private directory, `root/session_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallWorkspace {
    root: PathBuf,
    session_id: String,
    dir: PathBuf,
}

impl InstallWorkspace {
    /// Describe a workspace with a fresh random session id. Nothing is
    /// created on disk; see [`InstallWorkspace::create`].
    pub fn generate(root: &Path) -> Self {
        Self::with_session_id(root, &new_session_id())
    }

    /// Describe a workspace with a caller-chosen session id.
    ///
    /// The id is joined onto `root` verbatim. Whether the result really lies
    /// under `root` is checked by [`InstallWorkspace::verify_within_root`]
    /// before anything is extracted.
    pub fn with_session_id(root: &Path, session_id: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            session_id: session_id.to_string(),
            dir: root.join(session_id),
        }
    }

    /// Create the directory (and any missing parents). Idempotent.
    pub fn create(&self) -> Result<(), InstallError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|source| InstallError::fs("create directory", &self.dir, source))?;
        tracing::debug!(dir = %self.dir.display(), "Created install workspace");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fail unless the workspace resolves to a strict descendant of the root.
    ///
    /// Both sides are canonicalized, so `..` components and symlinks are
    /// resolved before comparing.
    pub fn verify_within_root(&self) -> Result<PathBuf, InstallError> {
        let root = canonical(&self.root)?;
        let dir = canonical(&self.dir)?;
        if dir != root && dir.starts_with(&root) {
            Ok(dir)
        } else {
            Err(InstallError::Validation { dir, root })
        }
    }
}

fn canonical(path: &Path) -> Result<PathBuf, InstallError> {
    std::fs::canonicalize(path).map_err(|source| InstallError::fs("resolve path", path, source))
}

/// Random lowercase hex token of [`SESSION_ID_LEN`] characters.
pub fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}
