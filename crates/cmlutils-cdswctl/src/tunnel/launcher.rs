//! `cdswctl ssh-endpoint` subprocess launcher.
//!
//! Spawns the endpoint process, waits (bounded) for its one-line banner and
//! hands the running process to the caller together with the parsed port.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::banner::{BannerError, PORT_FIELD, parse_banner};
use crate::cmd::CommandLine;

/// Runtime id meaning "use the project's default runtime".
pub const DEFAULT_RUNTIME: i64 = -1;

/// Most recent stderr bytes kept per endpoint process.
pub const STDERR_CAPACITY: usize = 64 * 1024;

/// Launcher settings.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// vCPUs requested for the endpoint session (`-c`).
    pub cpu: f64,
    /// Memory in GiB requested for the endpoint session (`-m`).
    pub memory_gib: f64,
    /// Upper bound on the wait for the banner line.
    pub banner_timeout: Duration,
    /// Upper bound on collecting stderr (and reaping) after a failure.
    pub drain_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_gib: 0.5,
            banner_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&cmlutils_core::config::TunnelSettings> for TunnelConfig {
    fn from(settings: &cmlutils_core::config::TunnelSettings) -> Self {
        Self {
            cpu: settings.cpu,
            memory_gib: settings.memory_gib,
            banner_timeout: Duration::from_secs(settings.banner_timeout_secs),
            ..Self::default()
        }
    }
}

/// Which project endpoint to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    /// Human-readable project name, only used in logs.
    pub project_name: String,
    /// Project slug passed to `-p`.
    pub project_slug: String,
    /// Runtime passed to `-r`; `None` uses the project default.
    pub runtime_id: Option<i64>,
}

impl EndpointRequest {
    /// Build a request from a raw runtime id where [`DEFAULT_RUNTIME`] means
    /// "no `-r` flag".
    pub fn new(
        project_name: impl Into<String>,
        project_slug: impl Into<String>,
        runtime_id: i64,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            project_slug: project_slug.into(),
            runtime_id: (runtime_id != DEFAULT_RUNTIME).then_some(runtime_id),
        }
    }
}

/// Launch progress, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    AwaitingBanner,
    Ready(u16),
    Failed,
}

/// Background reader that keeps the stderr pipe empty.
///
/// Holds the last [`STDERR_CAPACITY`] bytes for diagnostics.
#[derive(Debug)]
struct StderrCollector {
    tail: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrCollector {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let tail = Arc::new(Mutex::new(Vec::new()));
        let reader = stderr.map(|mut stderr| {
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut tail = tail.lock().await;
                            tail.extend_from_slice(&chunk[..n]);
                            if tail.len() > STDERR_CAPACITY {
                                let excess = tail.len() - STDERR_CAPACITY;
                                tail.drain(..excess);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read ssh-endpoint stderr");
                            break;
                        }
                    }
                }
                debug!("ssh-endpoint stderr reader finished");
            })
        });
        Self { tail, reader }
    }

    /// Stderr captured so far, lossily decoded and trimmed.
    async fn snapshot(&self) -> String {
        let tail = self.tail.lock().await;
        String::from_utf8_lossy(&tail).trim().to_string()
    }

    /// Wait up to `limit` for stderr to reach EOF, then return what was read.
    async fn finish(mut self, limit: Duration) -> String {
        if let Some(mut reader) = self.reader.take()
            && tokio::time::timeout(limit, &mut reader).await.is_err()
        {
            warn!("Gave up reading ssh-endpoint stderr");
            reader.abort();
        }
        self.snapshot().await
    }
}

/// A running endpoint process and the local port it listens on.
///
/// The caller owns the process: dropping the handle does not stop it. Use
/// [`TunnelHandle::shutdown`] or the child directly to terminate it. Stderr
/// keeps being drained in the background for as long as the process runs.
#[derive(Debug)]
pub struct TunnelHandle {
    child: Child,
    port: u16,
    stdout: BufReader<ChildStdout>,
    stderr: StderrCollector,
}

impl TunnelHandle {
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub const fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Remaining stdout after the banner line.
    pub const fn stdout_mut(&mut self) -> &mut BufReader<ChildStdout> {
        &mut self.stdout
    }

    /// Most recent stderr output of the process.
    pub async fn stderr_output(&self) -> String {
        self.stderr.snapshot().await
    }

    /// Interrupt the process, wait up to `grace`, then kill it.
    pub async fn shutdown(mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                match i32::try_from(pid) {
                    Ok(raw) => {
                        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGINT) {
                            warn!(pid, error = %e, "Failed to send SIGINT to ssh-endpoint");
                        }
                    }
                    Err(_) => warn!(pid, "Process id out of range for SIGINT"),
                }
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(port = self.port, ?status, "ssh-endpoint exited");
                Ok(status)
            }
            Ok(Err(e)) => {
                warn!(port = self.port, error = %e, "Error waiting for ssh-endpoint");
                self.child.kill().await?;
                self.child.wait().await
            }
            Err(_) => {
                warn!(port = self.port, "Timeout waiting for ssh-endpoint to exit, killing");
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Result of a launch that did not hit an error.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The banner was parsed; the process is running.
    Ready(TunnelHandle),
    /// The process closed stdout without writing anything.
    NotStarted { stderr: String },
}

impl LaunchOutcome {
    /// The port, or `None` when the endpoint did not start.
    pub const fn port(&self) -> Option<u16> {
        match self {
            Self::Ready(handle) => Some(handle.port),
            Self::NotStarted { .. } => None,
        }
    }

    pub fn into_handle(self) -> Option<TunnelHandle> {
        match self {
            Self::Ready(handle) => Some(handle),
            Self::NotStarted { .. } => None,
        }
    }
}

/// Errors from opening an SSH endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Failed to read ssh-endpoint output: {source} (stderr: {stderr})")]
    Io {
        source: std::io::Error,
        stderr: String,
    },

    #[error("SSH connection failed unexpectedly: {line:?}: {reason} (stderr: {stderr})")]
    Protocol {
        line: String,
        reason: BannerError,
        stderr: String,
    },

    #[error("No ssh-endpoint banner within {timeout:?} (stderr: {stderr})")]
    BannerTimeout { timeout: Duration, stderr: String },
}

/// Opens SSH endpoints with `cdswctl`, one per call.
#[derive(Debug, Clone, Default)]
pub struct TunnelLauncher {
    config: TunnelConfig,
}

impl TunnelLauncher {
    pub const fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// `ssh-endpoint -p <slug> -c <cpu> -m <mem> [-r <runtime>]`.
    pub fn endpoint_command(&self, binary: &Path, request: &EndpointRequest) -> CommandLine {
        let mut line = CommandLine::new(binary).args([
            "ssh-endpoint".to_string(),
            "-p".to_string(),
            request.project_slug.clone(),
            "-c".to_string(),
            resource_arg(self.config.cpu),
            "-m".to_string(),
            resource_arg(self.config.memory_gib),
        ]);
        if let Some(runtime_id) = request.runtime_id {
            line = line.arg("-r").arg(runtime_id.to_string());
        }
        line
    }

    /// Start the endpoint and wait for its banner.
    ///
    /// Returns [`LaunchOutcome::NotStarted`] when stdout reaches EOF before
    /// any byte is written, and an error when the first line (blank lines
    /// included) is not a banner, the wait times out, or the spawn fails.
    /// Stderr is drained concurrently throughout; on every non-ready path the
    /// child is stopped and its stderr returned.
    pub async fn open(
        &self,
        binary: &Path,
        request: &EndpointRequest,
    ) -> Result<LaunchOutcome, TunnelError> {
        let line = self.endpoint_command(binary, request);

        info!("Creating SSH connection");
        debug!(
            state = ?TunnelState::Starting,
            project = %request.project_name,
            slug = %request.project_slug,
            cdswctl = %binary.display(),
            runtime = %request
                .runtime_id
                .map_or_else(|| "default".to_string(), |id| id.to_string()),
            command = %line,
            "Opening SSH endpoint"
        );

        let mut child = line
            .to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                command: line.render(),
                source,
            })?;
        let stderr = StderrCollector::spawn(child.stderr.take());
        let Some(stdout) = child.stdout.take() else {
            let stderr = self.stop(&mut child, stderr, true).await;
            return Err(TunnelError::Io {
                source: std::io::Error::other("stdout was not captured"),
                stderr,
            });
        };
        let mut stdout = BufReader::new(stdout);

        info!(state = ?TunnelState::AwaitingBanner, "Waiting for SSH connection");
        let mut banner = String::new();
        let read =
            tokio::time::timeout(self.config.banner_timeout, stdout.read_line(&mut banner)).await;

        match read {
            Err(_) => {
                let stderr = self.stop(&mut child, stderr, true).await;
                error!(
                    state = ?TunnelState::Failed,
                    timeout = ?self.config.banner_timeout,
                    %stderr,
                    "SSH endpoint printed no banner in time"
                );
                Err(TunnelError::BannerTimeout {
                    timeout: self.config.banner_timeout,
                    stderr,
                })
            }
            Ok(Err(source)) => {
                let stderr = self.stop(&mut child, stderr, true).await;
                error!(
                    state = ?TunnelState::Failed,
                    error = %source,
                    %stderr,
                    "Failed to read SSH endpoint output"
                );
                Err(TunnelError::Io { source, stderr })
            }
            Ok(Ok(0)) => {
                let stderr = self.stop(&mut child, stderr, false).await;
                error!(
                    state = ?TunnelState::Failed,
                    "SSH endpoint failed to start - no output received"
                );
                error!(%stderr, "stderr output");
                Ok(LaunchOutcome::NotStarted { stderr })
            }
            Ok(Ok(_)) => match parse_banner(&banner) {
                Ok(port) => {
                    info!(state = ?TunnelState::Ready(port), "SSH connection successful");
                    debug!(port, "SSH endpoint established");
                    Ok(LaunchOutcome::Ready(TunnelHandle {
                        child,
                        port,
                        stdout,
                        stderr,
                    }))
                }
                Err(reason) => {
                    let line = banner.trim().to_string();
                    let stderr = self.stop(&mut child, stderr, true).await;
                    error!(
                        state = ?TunnelState::Failed,
                        %line,
                        %reason,
                        "SSH connection failed unexpectedly"
                    );
                    error!(%stderr, "stderr output");
                    debug!(
                        fields = ?line.split(' ').collect::<Vec<_>>(),
                        port_field = PORT_FIELD,
                        "Expected a space-separated line with the port number in the port field"
                    );
                    Err(TunnelError::Protocol {
                        line,
                        reason,
                        stderr,
                    })
                }
            },
        }
    }

    /// Stop a child that will not be handed out and return its stderr.
    ///
    /// With `kill_first`, the process is killed before stderr is collected so
    /// that a process that is still running cannot hold the pipe open.
    /// Otherwise stderr is collected first and the process is only killed if
    /// it is still alive afterwards.
    async fn stop(&self, child: &mut Child, stderr: StderrCollector, kill_first: bool) -> String {
        if kill_first
            && let Err(e) = child.start_kill()
        {
            debug!(error = %e, "ssh-endpoint already exited");
        }
        let text = stderr.finish(self.config.drain_timeout).await;
        if !kill_first
            && matches!(child.try_wait(), Ok(None))
            && let Err(e) = child.start_kill()
        {
            debug!(error = %e, "ssh-endpoint already exited");
        }
        match tokio::time::timeout(self.config.drain_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Reaped ssh-endpoint"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reap ssh-endpoint"),
            Err(_) => warn!("ssh-endpoint did not exit after kill"),
        }
        text
    }
}

/// Format a resource amount so whole numbers keep their decimal point
/// (`1.0`, not `1`).
fn resource_arg(value: f64) -> String {
    format!("{value:?}")
}
