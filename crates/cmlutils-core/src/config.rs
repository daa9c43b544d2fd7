//! Configuration resolution for cmlutils.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cmlutils/settings.json), or an explicit file
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding [`InstallConfig::root`].
pub const ENV_CDSWCTL_ROOT: &str = "CMLUTILS_CDSWCTL_ROOT";
/// Environment variable overriding [`TlsConfig::ca_path`].
pub const ENV_CA_PATH: &str = "CMLUTILS_CA_PATH";
/// Environment variable overriding [`TunnelSettings::banner_timeout_secs`].
pub const ENV_BANNER_TIMEOUT_SECS: &str = "CMLUTILS_BANNER_TIMEOUT_SECS";

/// Complete cmlutils configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Where `cdswctl` builds are installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallConfig {
    /// Shared root holding one subdirectory per install attempt.
    pub root: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("cmlutils").join("cdswctl"),
        }
    }
}

/// Resources requested for SSH endpoints and the banner wait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    /// vCPUs requested for the endpoint session.
    pub cpu: f64,
    /// Memory requested for the endpoint session, in GiB.
    pub memory_gib: f64,
    /// How long to wait for the port banner before giving up.
    pub banner_timeout_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_gib: 0.5,
            banner_timeout_secs: 60,
        }
    }
}

/// Transport trust settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// Empty for the system trust store, `"false"` to skip verification,
    /// otherwise a path to a PEM CA bundle.
    pub ca_path: String,
}

impl Config {
    /// Reject values that can never produce a working install or tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.install.root.as_os_str().is_empty() {
            return Err(Error::Config("install.root must not be empty".into()));
        }
        if self.tunnel.cpu.is_nan() || self.tunnel.cpu <= 0.0 {
            return Err(Error::Config(format!(
                "tunnel.cpu must be positive, got {}",
                self.tunnel.cpu
            )));
        }
        if self.tunnel.memory_gib.is_nan() || self.tunnel.memory_gib <= 0.0 {
            return Err(Error::Config(format!(
                "tunnel.memory_gib must be positive, got {}",
                self.tunnel.memory_gib
            )));
        }
        if self.tunnel.banner_timeout_secs == 0 {
            return Err(Error::Config(
                "tunnel.banner_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(explicit) => load_config_file(explicit)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cmlutils").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply overrides from a variable lookup (normally the process environment).
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup(ENV_CDSWCTL_ROOT)
        && !val.is_empty()
    {
        config.install.root = PathBuf::from(val);
    }
    if let Some(val) = lookup(ENV_CA_PATH) {
        config.tls.ca_path = val;
    }
    if let Some(val) = lookup(ENV_BANNER_TIMEOUT_SECS) {
        match val.parse() {
            Ok(n) => config.tunnel.banner_timeout_secs = n,
            Err(_) => tracing::warn!(
                var = ENV_BANNER_TIMEOUT_SECS,
                value = %val,
                "Ignoring non-numeric override"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_endpoint_flags() {
        let config = Config::default();
        assert_eq!(config.tunnel.cpu, 1.0);
        assert_eq!(config.tunnel.memory_gib, 0.5);
        assert_eq!(config.tunnel.banner_timeout_secs, 60);
        assert!(config.tls.ca_path.is_empty());
        assert!(config.install.root.ends_with("cmlutils/cdswctl"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"tunnel": {"cpu": 2.0}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.tunnel.cpu, 2.0);
        assert_eq!(config.tunnel.memory_gib, 0.5);
        assert_eq!(config.install, InstallConfig::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("Failed to parse")));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_CDSWCTL_ROOT, "/opt/cdswctl"),
            (ENV_CA_PATH, "false"),
            (ENV_BANNER_TIMEOUT_SECS, "5"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.install.root, PathBuf::from("/opt/cdswctl"));
        assert_eq!(config.tls.ca_path, "false");
        assert_eq!(config.tunnel.banner_timeout_secs, 5);
    }

    #[test]
    fn bad_timeout_override_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == ENV_BANNER_TIMEOUT_SECS).then(|| "soon".to_string())
        });
        assert_eq!(config.tunnel.banner_timeout_secs, 60);
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.tunnel.banner_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.tunnel.banner_timeout_secs = 1;
        config.tunnel.cpu = 0.0;
        assert!(config.validate().is_err());
    }
}
