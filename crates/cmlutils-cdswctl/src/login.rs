//! `cdswctl login`: authenticate a session against the workspace.
//!
//! The binary stores its own credentials; this module only runs it once and
//! reports whether it succeeded. The API key is masked in every log line and
//! error message.

use std::path::Path;
use std::process::ExitStatus;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::cmd::CommandLine;
use crate::fetch::CaTrust;

/// Flag appended when certificate verification is disabled.
pub const INSECURE_FLAG: &str = "--insecure-skip-verify";

/// Errors from `cdswctl login`.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("cdswctl login failed ({status}): {stderr}")]
    Auth { status: ExitStatus, stderr: String },
}

/// Captured output of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Build the login command line. The API key is a secret argument.
pub fn login_command(
    binary: &Path,
    host: &str,
    username: &str,
    api_key: &str,
    ca: &CaTrust,
) -> CommandLine {
    let mut line = CommandLine::new(binary)
        .args(["login", "-n", username, "-u", host, "-y"])
        .secret_arg(api_key, "api_key");
    if ca.is_insecure() {
        line = line.arg(INSECURE_FLAG);
    }
    line
}

/// Run `cdswctl login` to completion. Not retried.
pub async fn login(
    binary: &Path,
    host: &str,
    username: &str,
    api_key: &str,
    ca: &CaTrust,
) -> Result<LoginOutput, LoginError> {
    info!(%host, %username, "Logging into workspace via cdswctl");
    let line = login_command(binary, host, username, api_key, ca);
    if ca.is_insecure() {
        debug!("Added {INSECURE_FLAG} to cdswctl login command");
    }
    debug!(command = %line, "cdswctl login command");

    let output = line
        .to_command()
        .output()
        .await
        .map_err(|source| LoginError::Spawn {
            command: line.render(),
            source,
        })?;

    let stdout = line.scrub(&String::from_utf8_lossy(&output.stdout));
    let stderr = line.scrub(String::from_utf8_lossy(&output.stderr).trim());

    if !output.status.success() {
        error!(status = %output.status, %stderr, "cdswctl login failed");
        return Err(LoginError::Auth {
            status: output.status,
            stderr,
        });
    }

    info!("Login succeeded");
    debug!(stdout = %stdout.trim(), "cdswctl login output");
    Ok(LoginOutput { stdout, stderr })
}
