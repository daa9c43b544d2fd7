//! Platform detection and download URL resolution.

use reqwest::Url;

use crate::installer::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TarGz => write!(f, "tar.gz"),
            Self::Zip => write!(f, "zip"),
        }
    }
}

impl Os {
    /// Platform this binary was compiled for.
    ///
    /// Anything that is neither Linux nor macOS gets the Windows build.
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::Darwin
        } else {
            Self::Windows
        }
    }

    /// Archive format published for this platform.
    pub const fn archive_format(self) -> ArchiveFormat {
        match self {
            Self::Windows => ArchiveFormat::Zip,
            _ => ArchiveFormat::TarGz,
        }
    }

    /// Path of the archive relative to the server's `cli/` directory.
    const fn download_path(self) -> &'static str {
        match self {
            Self::Linux => "linux/amd64/cdsw.tar.gz",
            Self::Darwin => "darwin/amd64/cdsw.tar.gz",
            Self::Windows => "windows/amd64/cdsw.zip",
        }
    }
}

/// Where to fetch the `cdswctl` archive for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub os: Os,
    pub format: ArchiveFormat,
    pub url: Url,
}

impl DownloadTarget {
    /// Final path segment of the URL, used as the archive's file name.
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
    }
}

/// Build the download target for `os` from the workspace host URL.
///
/// Uses URL-join semantics: `cli/` is resolved against `host`, so a host with
/// a path but no trailing slash has its last segment replaced.
pub fn resolve_download_url(host: &str, os: Os) -> Result<DownloadTarget, InstallError> {
    let invalid = |e: &dyn std::fmt::Display| InstallError::InvalidUrl {
        url: host.to_string(),
        reason: e.to_string(),
    };
    let base = Url::parse(host).map_err(|e| invalid(&e))?;
    if base.cannot_be_a_base() {
        return Err(invalid(&"URL cannot be used as a base"));
    }
    let url = base
        .join("cli/")
        .and_then(|cli| cli.join(os.download_path()))
        .map_err(|e| invalid(&e))?;

    Ok(DownloadTarget {
        os,
        format: os.archive_format(),
        url,
    })
}
