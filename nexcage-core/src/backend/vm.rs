//! The VM backend: shapes `qm create` arguments from a `SandboxConfig` and
//! otherwise drives guests entirely through [`ProxmoxClient`], the same
//! split the LXC backend uses.

use std::process::Command;
use std::sync::Arc;

use tracing::info;

use super::{Backend, ContainerInfo, ExecResult};
use crate::error::{Error, Result};
use crate::proxmox::{ProxmoxClient, RemoteStatus};
use crate::sandbox::{ContainerType, SandboxConfig};
use crate::state::ContainerStatus;

/// Storage used for the root disk unless `SandboxConfig` says otherwise.
const DEFAULT_STORAGE: &str = "local-lvm";
/// Root disk size applied when `cfg.resources.disk_gib` is unset.
const DEFAULT_DISK_GIB: u32 = 20;
/// `qm`'s `ostype` value for a guest we don't have more specific info on.
const DEFAULT_OS_TYPE: &str = "l26";

/// VM container backend. `cfg.image` must already name an existing
/// template or ISO volume; this backend does not convert OCI bundles the
/// way the LXC backend does.
pub struct VmBackend {
    proxmox: Arc<ProxmoxClient>,
}

impl VmBackend {
    /// Builds a VM backend driving guests through `proxmox`.
    #[must_use]
    pub fn new(proxmox: Arc<ProxmoxClient>) -> Self {
        Self { proxmox }
    }

    fn vmid_for(&self, id: &str) -> Result<u32> {
        self.proxmox
            .find_vmid_by_name(id)?
            .ok_or_else(|| Error::NotFound(format!("vm {id}")))
    }
}

impl Backend for VmBackend {
    fn create(&self, cfg: &SandboxConfig) -> Result<()> {
        cfg.validate()?;
        if self.proxmox.find_vmid_by_name(&cfg.name)?.is_some() {
            return Err(Error::AlreadyExists(format!("vm {}", cfg.name)));
        }
        let Some(template) = &cfg.image else {
            return Err(Error::UsageError(
                "create requires an image template or ISO volume".to_string(),
            ));
        };

        let vmid = self.proxmox.allocate_vmid()?;
        let resources = cfg.resources.unwrap_or(crate::sandbox::ResourceLimits {
            memory_mib: None,
            cpu_cores: None,
            disk_gib: None,
        });
        let memory = resources.memory_mib.unwrap_or(2048);
        let cores = resources.cpu_cores.unwrap_or(1);
        let disk = resources.disk_gib.unwrap_or(DEFAULT_DISK_GIB);
        let bridge = cfg
            .network
            .as_ref()
            .map(|n| n.bridge.clone())
            .unwrap_or_else(|| "vmbr0".to_string());

        let argv = qm_argv(&cfg.name, memory, cores, disk, &bridge, template);
        self.qm_create(vmid, &argv)?;

        info!(container = cfg.name, vmid, "created vm");
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.start(vmid, "qemu")
    }

    fn stop(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.stop(vmid, "qemu")
    }

    fn delete(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.destroy(vmid, "qemu")
    }

    fn list(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .proxmox
            .list_containers()?
            .into_iter()
            .filter(|c| c.kind == "qemu")
            .map(|c| ContainerInfo {
                name: c.name,
                backend: ContainerType::Vm,
                status: map_status(c.status),
                pid: Some(c.vmid),
                ip: None,
            })
            .collect())
    }

    fn info(&self, id: &str) -> Result<ContainerInfo> {
        let vmid = self.vmid_for(id)?;
        let status = self.proxmox.status(vmid, "qemu")?;
        Ok(ContainerInfo {
            name: id.to_string(),
            backend: ContainerType::Vm,
            status: map_status(status),
            pid: Some(vmid),
            ip: None,
        })
    }

    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        let vmid = self.vmid_for(id)?;
        let output = Command::new("qm")
            .arg("guest")
            .arg("exec")
            .arg(vmid.to_string())
            .arg("--")
            .args(argv)
            .output()
            .map_err(|e| Error::io(std::path::Path::new("qm"), e))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl VmBackend {
    fn qm_create(&self, vmid: u32, argv: &[String]) -> Result<()> {
        let output = Command::new("qm")
            .arg("create")
            .arg(vmid.to_string())
            .args(argv)
            .output()
            .map_err(|e| Error::io(std::path::Path::new("qm"), e))?;
        if !output.status.success() {
            return Err(Error::ProxmoxCliError {
                argv_digest: nexcage_oci::content_digest(format!("qm create {vmid}").as_bytes()),
                exit_code: output.status.code().unwrap_or(-1),
                stderr_excerpt: crate::error::scrub_secrets(
                    &String::from_utf8_lossy(&output.stderr).chars().take(256).collect::<String>(),
                ),
            });
        }
        Ok(())
    }
}

fn map_status(status: RemoteStatus) -> ContainerStatus {
    match status {
        RemoteStatus::Running => ContainerStatus::Running,
        RemoteStatus::Paused => ContainerStatus::Paused,
        RemoteStatus::Stopped | RemoteStatus::Unknown => ContainerStatus::Stopped,
    }
}

fn qm_argv(name: &str, memory: u32, cores: u32, disk: u32, bridge: &str, template: &str) -> Vec<String> {
    vec![
        "--name".to_string(),
        name.to_string(),
        "--memory".to_string(),
        memory.to_string(),
        "--cores".to_string(),
        cores.to_string(),
        "--ostype".to_string(),
        DEFAULT_OS_TYPE.to_string(),
        "--scsi0".to_string(),
        format!("{DEFAULT_STORAGE}:{disk},import-from={template}"),
        "--net0".to_string(),
        format!("virtio,bridge={bridge}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qm_argv_includes_storage_and_template() {
        let argv = qm_argv("web-01", 2048, 2, 20, "vmbr0", "local:vztmpl/alpine.qcow2");
        assert!(argv.iter().any(|a| a.contains("import-from=local:vztmpl/alpine.qcow2")));
        assert!(argv.iter().any(|a| a == "web-01"));
    }
}
