//! `cmlutils` command-line tool.
//!
//! Installs the `cdswctl` binary for a workspace, logs in with it and opens
//! SSH endpoints into projects.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use cmlutils_cdswctl::{
    CaTrust, EndpointRequest, Installer, LaunchOutcome, TunnelConfig, TunnelLauncher, login,
};
use cmlutils_core::Config;

/// Grace period between SIGINT and SIGKILL when closing a tunnel.
const TUNNEL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "cmlutils", version, about = "Install and drive the cdswctl workspace CLI")]
struct Cli {
    /// Settings file (defaults to the global settings.json when present).
    #[arg(long, global = true, env = "CMLUTILS_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "CMLUTILS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download and install cdswctl from a workspace
    Install(InstallArgs),
    /// Log into a workspace with cdswctl
    Login(LoginArgs),
    /// Open an SSH endpoint into a project and hold it until Ctrl-C
    SshEndpoint(EndpointArgs),
}

#[derive(Debug, Args)]
struct TransportArgs {
    /// Workspace URL, e.g. https://ml.example.com
    #[arg(long, env = "CMLUTILS_HOST")]
    host: String,

    /// CA bundle path, or "false" to skip certificate verification.
    #[arg(long)]
    ca_path: Option<String>,
}

#[derive(Debug, Args)]
struct InstallArgs {
    #[command(flatten)]
    transport: TransportArgs,

    /// Directory holding install workspaces.
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct LoginArgs {
    #[command(flatten)]
    transport: TransportArgs,

    /// Installed cdswctl; downloaded from the host when omitted.
    #[arg(long)]
    binary: Option<PathBuf>,

    #[arg(long, env = "CMLUTILS_USERNAME")]
    username: String,

    #[arg(long, env = "CMLUTILS_API_KEY", hide_env_values = true)]
    api_key: String,
}

#[derive(Debug, Args)]
struct EndpointArgs {
    /// Installed cdswctl, already logged in.
    #[arg(long)]
    binary: PathBuf,

    /// Project name, used in logs.
    #[arg(long)]
    project_name: String,

    #[arg(long)]
    project_slug: String,

    /// Runtime id; -1 uses the project default.
    #[arg(
        long,
        default_value_t = cmlutils_cdswctl::tunnel::DEFAULT_RUNTIME,
        allow_hyphen_values = true
    )]
    runtime_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cmlutils_core::tracing_init::init_tracing(
        "cmlutils=info,cmlutils_cdswctl=info,cmlutils_core=info",
        cli.log_json,
    );

    let config = cmlutils_core::config::load_config(cli.config.as_deref())
        .context("Failed to load settings")?;

    match cli.command {
        Commands::Install(args) => install(config, args).await,
        Commands::Login(args) => run_login(config, args).await,
        Commands::SshEndpoint(args) => ssh_endpoint(&config, args).await,
    }
}

fn ca_trust(config: &Config, flag: Option<&str>) -> CaTrust {
    CaTrust::from_ca_path(flag.unwrap_or(&config.tls.ca_path))
}

async fn install(mut config: Config, args: InstallArgs) -> anyhow::Result<()> {
    if let Some(root) = args.root {
        config.install.root = root;
        config.validate()?;
    }
    let ca = ca_trust(&config, args.transport.ca_path.as_deref());

    let binary = obtain(&config, &args.transport.host, &ca).await?;
    print_line(&binary.display());
    Ok(())
}

async fn obtain(config: &Config, host: &str, ca: &CaTrust) -> anyhow::Result<PathBuf> {
    let binary = Installer::new(&config.install.root)
        .obtain(host, ca)
        .await
        .with_context(|| format!("Failed to install cdswctl from {host}"))?;
    Ok(binary.into_path())
}

async fn run_login(config: Config, args: LoginArgs) -> anyhow::Result<()> {
    let ca = ca_trust(&config, args.transport.ca_path.as_deref());
    let host = args.transport.host;

    let binary = match args.binary {
        Some(binary) => binary,
        None => obtain(&config, &host, &ca).await?,
    };

    let output = login(&binary, &host, &args.username, &args.api_key, &ca)
        .await
        .context("cdswctl login failed")?;
    if !output.stdout.trim().is_empty() {
        print_line(&output.stdout.trim());
    }
    Ok(())
}

async fn ssh_endpoint(config: &Config, args: EndpointArgs) -> anyhow::Result<()> {
    ensure_binary(&args.binary)?;
    let launcher = TunnelLauncher::new(TunnelConfig::from(&config.tunnel));
    let request = EndpointRequest::new(args.project_name, args.project_slug, args.runtime_id);

    let handle = match launcher.open(&args.binary, &request).await? {
        LaunchOutcome::Ready(handle) => handle,
        LaunchOutcome::NotStarted { stderr } => {
            bail!("SSH endpoint for {} did not start: {stderr}", request.project_slug)
        }
    };

    print_line(&handle.port());
    info!(port = handle.port(), "Holding SSH endpoint open, press Ctrl-C to close");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, closing endpoint");
    }
    let status = handle
        .shutdown(TUNNEL_SHUTDOWN_GRACE)
        .await
        .context("Failed to stop ssh-endpoint")?;
    info!(?status, "SSH endpoint closed");
    Ok(())
}

fn ensure_binary(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        bail!("cdswctl binary not found at {}", path.display());
    }
    Ok(())
}

/// Command results go to stdout; logs stay on stderr.
#[allow(clippy::print_stdout)]
fn print_line(value: &dyn std::fmt::Display) {
    println!("{value}");
}
