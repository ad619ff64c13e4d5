//! `config.json` loading.
//!
//! Located via `--config`, else `./config.json`, else
//! `/etc/nexcage/config.json`. Unknown keys are logged and ignored, never
//! rejected — `serde_json` does this by default as long as we don't ask
//! for `deny_unknown_fields`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::sandbox::ContainerType;

/// Proxmox connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Proxmox API host.
    pub host: String,
    /// Proxmox API port.
    pub port: u16,
    /// Proxmox node name.
    pub node: String,
    /// `PVEAPIToken=user@realm!id=secret`; required when a backend needs the API.
    pub token: Option<String>,
    /// Whether to verify the Proxmox TLS certificate.
    pub verify_ssl: bool,
    /// Path to `pct`, resolved via `PATH` if not absolute.
    pub pct_path: String,
    /// Path to `qm`, resolved via `PATH` if not absolute.
    pub qm_path: String,
    /// HTTP timeout in seconds.
    pub timeout: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8006,
            node: "pve".to_string(),
            token: None,
            verify_ssl: false,
            pct_path: "pct".to_string(),
            qm_path: "qm".to_string(),
            timeout: 30,
        }
    }
}

/// Runtime (orchestrator-level) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `debug|info|warn|error`.
    pub log_level: String,
    /// State directory, default `/var/lib/nexcage`.
    pub root_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            root_path: PathBuf::from("/var/lib/nexcage"),
        }
    }
}

/// Backend routing settings, consumed by the [`crate::router`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRoutingConfig {
    /// Glob patterns (with `*` wildcard) routing to the OCI runtime backend.
    pub crun_name_patterns: Vec<String>,
    /// Backend used when no pattern matches.
    pub default_container_type: ContainerType,
}

impl Default for ContainerRoutingConfig {
    fn default() -> Self {
        Self {
            crun_name_patterns: Vec::new(),
            default_container_type: ContainerType::Lxc,
        }
    }
}

/// The full parsed `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxmox connection settings.
    pub proxmox: ProxmoxConfig,
    /// Runtime settings.
    pub runtime: RuntimeConfig,
    /// Container routing settings.
    pub container_config: ContainerRoutingConfig,
}

/// Resolves the config-file path: `explicit`, else `NEXCAGE_CONFIG`, else
/// `./config.json`, else `/etc/nexcage/config.json`.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(env_path) = std::env::var("NEXCAGE_CONFIG") {
        return PathBuf::from(env_path);
    }
    let cwd_config = PathBuf::from("config.json");
    if cwd_config.is_file() {
        return cwd_config;
    }
    PathBuf::from("/etc/nexcage/config.json")
}

/// Loads and parses the config file at `path`. A missing file yields
/// `Config::default()`; a present-but-unparseable file is an error.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    warn_unknown_keys(&value);
    let config: Config = serde_json::from_value(value)?;
    Ok(config)
}

/// Recognized top-level and nested keys; anything else is logged and ignored.
const KNOWN_TOP_LEVEL: &[&str] = &["proxmox", "runtime", "container_config"];

fn warn_unknown_keys(value: &serde_json::Value) {
    if let Some(obj) = value.as_object() {
        for key in obj.keys() {
            if !KNOWN_TOP_LEVEL.contains(&key.as_str()) {
                warn!(key, "ignoring unrecognized config.json key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let config = load(Path::new("/nonexistent/config.json")).expect("load");
        assert_eq!(config.proxmox.host, "localhost");
    }

    #[test]
    fn parses_recognized_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"proxmox":{"host":"pve.local","port":8007},"unknown_key":123}"#,
        )
        .expect("write");
        let config = load(&path).expect("load");
        assert_eq!(config.proxmox.host, "pve.local");
        assert_eq!(config.proxmox.port, 8007);
    }

    #[test]
    fn resolve_config_path_prefers_explicit() {
        let explicit = Path::new("/tmp/explicit.json");
        assert_eq!(resolve_config_path(Some(explicit)), explicit);
    }
}
