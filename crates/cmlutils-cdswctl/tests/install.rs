#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end installer tests with an in-memory fetcher serving fixture
//! archives built on the fly.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::Url;

use cmlutils_cdswctl::archive::ArchiveError;
use cmlutils_cdswctl::{
    CaTrust, Fetch, FetchError, InstallError, InstallWorkspace, Installer, Os, binary_name,
    resolve_download_url,
};

const BINARY_BYTES: &[u8] = b"#!/bin/sh\necho cdswctl\n";

/// Serves fixed bytes for every URL and counts calls.
#[derive(Clone)]
struct StaticFetcher {
    body: Arc<Vec<u8>>,
    calls: Arc<AtomicUsize>,
    seen_ca: Arc<std::sync::Mutex<Vec<CaTrust>>>,
}

impl StaticFetcher {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            calls: Arc::new(AtomicUsize::new(0)),
            seen_ca: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetch for StaticFetcher {
    async fn fetch(&self, _url: &Url, destination: &Path, ca: &CaTrust) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_ca.lock().unwrap().push(ca.clone());
        std::fs::write(destination, self.body.as_slice())
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(self.body.len() as u64)
    }
}

/// Always fails like an unreachable host.
struct FailingFetcher;

impl Fetch for FailingFetcher {
    async fn fetch(
        &self,
        url: &Url,
        _destination: &Path,
        _ca: &CaTrust,
    ) -> Result<u64, FetchError> {
        Err(FetchError::Status {
            url: url.to_string(),
            status: 503,
        })
    }
}

/// gzip'd tarball with `files` as `(path, contents)`.
fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn zipball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    for (path, data) in files {
        zip.start_file(*path, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap()
}

#[tokio::test]
async fn tarball_installs_single_binary() {
    let root = tempfile::tempdir().unwrap();
    let inner = format!("cdsw-8.0.1/{}", binary_name());
    let fetcher = StaticFetcher::new(tarball(&[(inner.as_str(), BINARY_BYTES)]));
    let installer = Installer::with_fetcher(root.path(), fetcher.clone());

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let binary = installer
        .fetch_and_install(&target, &CaTrust::Default)
        .await
        .unwrap();

    let dir = binary.path().parent().unwrap();
    assert_eq!(dir.parent().unwrap(), canonical(root.path()));
    assert_eq!(dir.file_name().unwrap().len(), 10);
    assert_eq!(binary.path().file_name().unwrap().to_string_lossy(), binary_name());
    assert_eq!(entries(dir), [binary_name()]);
    assert_eq!(std::fs::read(binary.path()).unwrap(), BINARY_BYTES);
    assert_eq!(fetcher.calls(), 1);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(binary.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}

#[tokio::test]
async fn zip_installs_single_binary() {
    let root = tempfile::tempdir().unwrap();
    let inner = format!("cdsw/{}", binary_name());
    let fetcher = StaticFetcher::new(zipball(&[(inner.as_str(), BINARY_BYTES)]));
    let installer = Installer::with_fetcher(root.path(), fetcher);

    let target = resolve_download_url("https://ml.example.com", Os::Windows).unwrap();
    let binary = installer
        .fetch_and_install(&target, &CaTrust::Default)
        .await
        .unwrap();

    let dir = binary.path().parent().unwrap();
    assert_eq!(entries(dir), [binary_name()]);
    assert_eq!(std::fs::read(binary.path()).unwrap(), BINARY_BYTES);
}

#[tokio::test]
async fn ca_trust_is_passed_through_to_fetcher() {
    let root = tempfile::tempdir().unwrap();
    let inner = format!("cdsw/{}", binary_name());
    let fetcher = StaticFetcher::new(tarball(&[(inner.as_str(), BINARY_BYTES)]));
    let installer = Installer::with_fetcher(root.path(), fetcher.clone());

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    installer
        .fetch_and_install(&target, &CaTrust::from_ca_path("false"))
        .await
        .unwrap();

    assert_eq!(*fetcher.seen_ca.lock().unwrap(), [CaTrust::Insecure]);
}

#[tokio::test]
async fn escaping_workspace_is_rejected_without_extraction() {
    let parent = tempfile::tempdir().unwrap();
    let root = parent.path().join("root");
    std::fs::create_dir(&root).unwrap();

    let inner = format!("cdsw/{}", binary_name());
    let fetcher = StaticFetcher::new(tarball(&[(inner.as_str(), BINARY_BYTES)]));
    let installer = Installer::with_fetcher(&root, fetcher.clone());

    let workspace = InstallWorkspace::with_session_id(&root, "../outside");
    workspace.create().unwrap();

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let err = installer
        .install_into(&workspace, &target, &CaTrust::Default)
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Validation { .. }), "got {err}");
    assert_eq!(fetcher.calls(), 1);
    // Nothing extracted, and the downloaded archive was cleaned up.
    assert!(entries(&parent.path().join("outside")).is_empty());
}

#[tokio::test]
async fn two_top_level_dirs_are_an_archive_error() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = StaticFetcher::new(tarball(&[
        ("a/cdswctl", BINARY_BYTES),
        ("b/cdswctl", BINARY_BYTES),
    ]));
    let installer = Installer::with_fetcher(root.path(), fetcher);

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let err = installer
        .fetch_and_install(&target, &CaTrust::Default)
        .await
        .unwrap_err();

    match err {
        InstallError::Archive(ArchiveError::UnexpectedLayout { entries, .. }) => {
            assert_eq!(entries, ["a", "b"]);
        }
        other => panic!("expected layout error, got {other}"),
    }
}

#[tokio::test]
async fn archive_without_binary_is_an_archive_error() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = StaticFetcher::new(tarball(&[("cdsw/README", b"docs")]));
    let installer = Installer::with_fetcher(root.path(), fetcher);

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let err = installer
        .fetch_and_install(&target, &CaTrust::Default)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InstallError::Archive(ArchiveError::MissingBinary { .. })
    ));
}

#[tokio::test]
async fn corrupt_download_removes_archive() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = StaticFetcher::new(b"<html>502</html>".to_vec());
    let installer = Installer::with_fetcher(root.path(), fetcher);

    let workspace = installer.create_workspace().unwrap();
    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let err = installer
        .install_into(&workspace, &target, &CaTrust::Default)
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Archive(ArchiveError::Extract { .. })));
    assert!(entries(workspace.dir()).is_empty());
}

#[tokio::test]
async fn transport_failure_propagates() {
    let root = tempfile::tempdir().unwrap();
    let installer = Installer::with_fetcher(root.path(), FailingFetcher);

    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();
    let err = installer
        .fetch_and_install(&target, &CaTrust::Default)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InstallError::Transport(FetchError::Status { status: 503, .. })
    ));
}

#[tokio::test]
async fn concurrent_installs_use_separate_workspaces() {
    let root = tempfile::tempdir().unwrap();
    let inner = format!("cdsw/{}", binary_name());
    let fetcher = StaticFetcher::new(tarball(&[(inner.as_str(), BINARY_BYTES)]));
    let installer = Installer::with_fetcher(root.path(), fetcher);
    let target = resolve_download_url("https://ml.example.com", Os::Linux).unwrap();

    let (a, b) = tokio::join!(
        installer.fetch_and_install(&target, &CaTrust::Default),
        installer.fetch_and_install(&target, &CaTrust::Default),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.path(), b.path());
    assert!(a.path().is_file());
    assert!(b.path().is_file());
    assert_eq!(entries(root.path()).len(), 2);
}
