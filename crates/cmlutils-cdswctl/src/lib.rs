//! Lifecycle management for the `cdswctl` control-plane binary.
//!
//! - [`installer`]: download, verify, extract and install a platform build
//! - [`login`]: authenticate a session through `cdswctl login`
//! - [`tunnel`]: launch `cdswctl ssh-endpoint` and recover its local port

pub mod archive;
pub mod cmd;
pub mod fetch;
pub mod installer;
pub mod login;
pub mod platform;
pub mod tunnel;
pub mod workspace;

pub use fetch::{CaTrust, Fetch, FetchError, HttpFetcher};
pub use installer::{InstallError, InstalledBinary, Installer};
pub use login::{LoginError, LoginOutput, login};
pub use platform::{ArchiveFormat, DownloadTarget, Os, resolve_download_url};
pub use tunnel::{
    EndpointRequest, LaunchOutcome, TunnelConfig, TunnelError, TunnelHandle, TunnelLauncher,
};
pub use workspace::InstallWorkspace;

/// File name of the binary inside the archive and in the install directory.
pub fn binary_name() -> String {
    format!("cdswctl{}", std::env::consts::EXE_SUFFIX)
}
