//! The OCI-runtime backend: drives an external `crun`-compatible binary
//! over its standard `create`/`start`/`kill`/`delete` subcommands, with
//! state tracked the same way the rest of this crate tracks it — one
//! `state.json` per container under a root directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use super::{Backend, ContainerInfo, ExecResult};
use crate::error::{Error, Result};
use crate::layerfs::LayerFS;
use crate::sandbox::{ContainerType, SandboxConfig};
use crate::state::{ContainerState, ContainerStatus};

/// Default state root when `config.json`'s `runtime.root_path` isn't set
/// to something else for this backend specifically.
const DEFAULT_ROOT: &str = "/run/nexcage";

/// The external OCI runtime backend.
pub struct OciRuntimeBackend {
    binary: String,
    root: PathBuf,
    layerfs: std::sync::Arc<LayerFS>,
}

impl OciRuntimeBackend {
    /// Builds a backend invoking `binary` (e.g. `crun`) for every
    /// lifecycle operation, tracking state under `root`.
    #[must_use]
    pub fn new(binary: impl Into<String>, root: Option<PathBuf>, layerfs: std::sync::Arc<LayerFS>) -> Self {
        Self {
            binary: binary.into(),
            root: root.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)),
            layerfs,
        }
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("bundle")
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing {
                        name: self.binary.clone(),
                    }
                } else {
                    Error::io(Path::new(&self.binary), e)
                }
            })?;
        if !output.status.success() {
            return Err(Error::ProxmoxCliError {
                argv_digest: nexcage_oci::content_digest(
                    format!("{} {}", self.binary, args.join(" ")).as_bytes(),
                ),
                exit_code: output.status.code().unwrap_or(-1),
                stderr_excerpt: crate::error::scrub_secrets(
                    &String::from_utf8_lossy(&output.stderr).chars().take(256).collect::<String>(),
                ),
            });
        }
        Ok(())
    }

    fn write_bundle(&self, id: &str, cfg: &SandboxConfig) -> Result<PathBuf> {
        let bundle_dir = self.bundle_dir(id);
        let rootfs_dir = bundle_dir.join("rootfs");
        std::fs::create_dir_all(&rootfs_dir).map_err(|e| Error::io(&rootfs_dir, e))?;

        if let Some(image) = &cfg.image {
            self.layerfs.mount_overlay(image, &rootfs_dir)?;
        }

        let config = serde_json::json!({
            "ociVersion": "1.0.2",
            "process": {
                "args": cfg.command.clone().unwrap_or_else(|| vec!["/bin/sh".to_string()]),
                "cwd": cfg.workdir.clone().unwrap_or_else(|| "/".to_string()),
                "env": cfg.env.clone().unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>(),
            },
            "root": { "path": "rootfs", "readonly": false },
            "hostname": cfg.name,
        });
        let config_path = bundle_dir.join("config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)
            .map_err(|e| Error::io(&config_path, e))?;
        Ok(bundle_dir)
    }
}

impl Backend for OciRuntimeBackend {
    fn create(&self, cfg: &SandboxConfig) -> Result<()> {
        cfg.validate()?;
        let dir = self.container_dir(&cfg.name);
        if dir.exists() {
            return Err(Error::AlreadyExists(format!("container {}", cfg.name)));
        }
        let bundle_dir = self.write_bundle(&cfg.name, cfg)?;
        self.run(&["create", &cfg.name, "--bundle", &bundle_dir.display().to_string()])?;

        let state = ContainerState::new(&cfg.name, ContainerType::OciRuntime, Some(bundle_dir));
        state.save(&dir).map_err(|e| Error::io(&dir, e))?;
        info!(container = cfg.name, "created oci-runtime container");
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id])?;
        update_status(&self.container_dir(id), ContainerStatus::Running)
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.run(&["kill", id, "SIGTERM"])?;
        update_status(&self.container_dir(id), ContainerStatus::Stopped)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.run(&["delete", id])?;
        let dir = self.container_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))
    }

    fn list(&self) -> Result<Vec<ContainerInfo>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut containers = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))? {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Ok(state) = ContainerState::load(&entry.path()) {
                containers.push(ContainerInfo {
                    name: state.id,
                    backend: ContainerType::OciRuntime,
                    status: state.status,
                    pid: state.pid,
                    ip: None,
                });
            }
        }
        Ok(containers)
    }

    fn info(&self, id: &str) -> Result<ContainerInfo> {
        let dir = self.container_dir(id);
        let state = ContainerState::load(&dir).map_err(|_| Error::NotFound(format!("container {id}")))?;
        Ok(ContainerInfo {
            name: state.id,
            backend: ContainerType::OciRuntime,
            status: state.status,
            pid: state.pid,
            ip: None,
        })
    }

    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|e| Error::io(Path::new(&self.binary), e))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn update_status(dir: &Path, status: ContainerStatus) -> Result<()> {
    let mut state = ContainerState::load(dir).map_err(|e| Error::io(dir, e))?;
    state.status = status;
    state.save(dir).map_err(|e| Error::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_dir_nests_under_root() {
        let layerfs = std::sync::Arc::new(LayerFS::open(std::env::temp_dir().join("nexcage-test-layers"), 4).expect("open"));
        let backend = OciRuntimeBackend::new("crun", Some(PathBuf::from("/run/nexcage")), layerfs);
        assert_eq!(backend.container_dir("web-01"), PathBuf::from("/run/nexcage/web-01"));
    }
}
