//! Archive download capability.
//!
//! The installer only depends on the [`Fetch`] trait; [`HttpFetcher`] is the
//! reqwest-backed implementation used by the binary.

use std::future::Future;
use std::path::{Path, PathBuf};

use reqwest::Url;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Trust configuration for the download transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CaTrust {
    /// System trust store.
    #[default]
    Default,
    /// Skip certificate verification entirely.
    Insecure,
    /// Trust the PEM bundle at this path.
    Bundle(PathBuf),
}

impl CaTrust {
    /// Interpret a `ca_path` setting: empty is the default store, `"false"`
    /// (any case) disables verification, anything else is a bundle path.
    pub fn from_ca_path(ca_path: &str) -> Self {
        if ca_path.is_empty() {
            Self::Default
        } else if ca_path.eq_ignore_ascii_case("false") {
            Self::Insecure
        } else {
            Self::Bundle(PathBuf::from(ca_path))
        }
    }

    pub const fn is_insecure(&self) -> bool {
        matches!(self, Self::Insecure)
    }
}

/// Transport-level download failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Download `url` into `destination`, returning the number of bytes written.
pub trait Fetch {
    fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        ca: &CaTrust,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send;
}

/// [`Fetch`] over HTTPS with reqwest and rustls.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl HttpFetcher {
    async fn client(ca: &CaTrust) -> Result<reqwest::Client, FetchError> {
        // reqwest is built with rustls-no-provider; `Err` only means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = reqwest::Client::builder();
        match ca {
            CaTrust::Default => {}
            CaTrust::Insecure => {
                tracing::warn!("TLS certificate verification disabled for download");
                builder = builder.danger_accept_invalid_certs(true);
            }
            CaTrust::Bundle(path) => {
                let pem = tokio::fs::read(path)
                    .await
                    .map_err(|source| FetchError::CaBundle {
                        path: path.clone(),
                        source,
                    })?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
        }
        Ok(builder.build()?)
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &Url, destination: &Path, ca: &CaTrust) -> Result<u64, FetchError> {
        let client = Self::client(ca).await?;

        tracing::info!(%url, destination = %destination.display(), "Downloading cdswctl archive");
        let mut resp = client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let write_err = |source| FetchError::Write {
            path: destination.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(write_err)?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;

        tracing::debug!(%url, bytes = written, "Download complete");
        Ok(written)
    }
}
