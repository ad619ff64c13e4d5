//! The LXC backend: shapes `pct create` arguments from a `SandboxConfig`
//! and otherwise drives containers entirely through [`ProxmoxClient`].

use std::process::Command;
use std::sync::Arc;

use tracing::info;

use super::{Backend, ContainerInfo, ExecResult};
use crate::error::{Error, Result};
use crate::image_converter::ImageConverter;
use crate::proxmox::{ProxmoxClient, RemoteStatus};
use crate::sandbox::{ContainerType, SandboxConfig};
use crate::state::ContainerStatus;

/// Proxmox storage used for both the root disk and uploaded templates
/// unless `SandboxConfig` says otherwise.
const DEFAULT_STORAGE: &str = "local-lvm";
/// Root disk size applied when `cfg.resources.disk_gib` is unset.
const DEFAULT_DISK_GIB: u32 = 8;

/// LXC container backend.
pub struct LxcBackend {
    proxmox: Arc<ProxmoxClient>,
    converter: ImageConverter,
}

impl LxcBackend {
    /// Builds an LXC backend sharing `proxmox` with the converter it owns.
    #[must_use]
    pub fn new(proxmox: Arc<ProxmoxClient>, converter: ImageConverter) -> Self {
        Self { proxmox, converter }
    }

    fn vmid_for(&self, id: &str) -> Result<u32> {
        self.proxmox
            .find_vmid_by_name(id)?
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    /// Qualifies a bare template name into the `<storage>:vztmpl/<name>`
    /// form `pct create` requires as its ostemplate operand. A name that
    /// already carries a storage prefix is passed through unchanged.
    fn ostemplate_ref(&self, template: &str) -> String {
        if template.contains(':') {
            return template.to_string();
        }
        format!("{}:vztmpl/{template}", self.converter.storage())
    }

    fn resolve_template(&self, cfg: &SandboxConfig) -> Result<String> {
        let Some(image) = &cfg.image else {
            return Err(Error::UsageError(
                "create requires an image or template name".to_string(),
            ));
        };
        let path = std::path::Path::new(image);
        if path.join("config.json").is_file() {
            // `Backend` is a synchronous trait invoked from the CLI's
            // multi-threaded runtime; block_in_place lets this one call
            // await the converter without needing an async trait.
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|e| Error::InternalError(format!("no tokio runtime available: {e}")))?;
            tokio::task::block_in_place(|| handle.block_on(self.converter.convert(path, &cfg.name)))
        } else {
            Ok(image.clone())
        }
    }
}

impl Backend for LxcBackend {
    fn create(&self, cfg: &SandboxConfig) -> Result<()> {
        cfg.validate()?;
        if self.proxmox.find_vmid_by_name(&cfg.name)?.is_some() {
            return Err(Error::AlreadyExists(format!("container {}", cfg.name)));
        }

        let template = self.resolve_template(cfg)?;
        let vmid = self.proxmox.allocate_vmid()?;

        let resources = cfg.resources.unwrap_or(crate::sandbox::ResourceLimits {
            memory_mib: None,
            cpu_cores: None,
            disk_gib: None,
        });
        let memory = resources.memory_mib.unwrap_or(512);
        let cores = resources.cpu_cores.unwrap_or(1);
        let disk = resources.disk_gib.unwrap_or(DEFAULT_DISK_GIB);
        let bridge = cfg
            .network
            .as_ref()
            .map(|n| n.bridge.clone())
            .unwrap_or_else(|| "vmbr0".to_string());

        let mut argv = vec![self.ostemplate_ref(&template)];
        argv.extend(template_argv(
            &cfg.name,
            memory,
            cores,
            disk,
            &bridge,
            cfg.security.unprivileged,
        ));
        self.pct_create(vmid, &argv)?;

        for volume in &cfg.volumes {
            self.append_mount_entry(vmid, volume)?;
        }

        info!(container = cfg.name, vmid, "created lxc container");
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.start(vmid, "lxc")
    }

    fn stop(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.stop(vmid, "lxc")
    }

    fn delete(&self, id: &str) -> Result<()> {
        let vmid = self.vmid_for(id)?;
        self.proxmox.destroy(vmid, "lxc")
    }

    fn list(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .proxmox
            .list_containers()?
            .into_iter()
            .filter(|c| c.kind == "lxc")
            .map(|c| ContainerInfo {
                name: c.name,
                backend: ContainerType::Lxc,
                status: map_status(c.status),
                pid: Some(c.vmid),
                ip: None,
            })
            .collect())
    }

    fn info(&self, id: &str) -> Result<ContainerInfo> {
        let vmid = self.vmid_for(id)?;
        let status = self.proxmox.status(vmid, "lxc")?;
        Ok(ContainerInfo {
            name: id.to_string(),
            backend: ContainerType::Lxc,
            status: map_status(status),
            pid: Some(vmid),
            ip: None,
        })
    }

    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        let vmid = self.vmid_for(id)?;
        let pct = self.proxmox.pct_path();
        let output = Command::new(pct)
            .arg("exec")
            .arg(vmid.to_string())
            .arg("--")
            .args(argv)
            .output()
            .map_err(|e| Error::io(std::path::Path::new(pct), e))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl LxcBackend {
    fn pct_create(&self, vmid: u32, argv: &[String]) -> Result<()> {
        let pct = self.proxmox.pct_path();
        let output = Command::new(pct)
            .arg("create")
            .arg(vmid.to_string())
            .args(argv)
            .output()
            .map_err(|e| Error::io(std::path::Path::new(pct), e))?;
        if !output.status.success() {
            return Err(Error::ProxmoxCliError {
                argv_digest: nexcage_oci::content_digest(format!("{pct} create {vmid}").as_bytes()),
                exit_code: output.status.code().unwrap_or(-1),
                stderr_excerpt: crate::error::scrub_secrets(
                    &String::from_utf8_lossy(&output.stderr).chars().take(256).collect::<String>(),
                ),
            });
        }
        Ok(())
    }

    fn append_mount_entry(&self, vmid: u32, volume: &crate::sandbox::VolumeMount) -> Result<()> {
        let conf_path = format!("/etc/pve/lxc/{vmid}.conf");
        let path = std::path::Path::new(&conf_path);
        let flag = if volume.read_only { ",ro=1" } else { "" };
        let line = format!(
            "mp0: {}:{}{flag}\n",
            volume.host_path.display(),
            volume.container_path.display()
        );
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| Error::io(path, e))
    }
}

fn map_status(status: RemoteStatus) -> ContainerStatus {
    match status {
        RemoteStatus::Running => ContainerStatus::Running,
        RemoteStatus::Paused => ContainerStatus::Paused,
        RemoteStatus::Stopped | RemoteStatus::Unknown => ContainerStatus::Stopped,
    }
}

fn template_argv(name: &str, memory: u32, cores: u32, disk: u32, bridge: &str, unprivileged: bool) -> Vec<String> {
    vec![
        "--hostname".to_string(),
        name.to_string(),
        "--memory".to_string(),
        memory.to_string(),
        "--cores".to_string(),
        cores.to_string(),
        "--rootfs".to_string(),
        format!("{DEFAULT_STORAGE}:{disk}"),
        "--net0".to_string(),
        format!("name=eth0,bridge={bridge},ip=dhcp"),
        "--unprivileged".to_string(),
        u8::from(unprivileged).to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_argv_includes_unprivileged_flag() {
        let argv = template_argv("web-01", 512, 1, 8, "vmbr0", true);
        assert!(argv.windows(2).any(|w| w[0] == "--unprivileged" && w[1] == "1"));
    }

    #[test]
    fn ostemplate_ref_qualifies_bare_names() {
        let config = crate::config::ProxmoxConfig::default();
        let proxmox = Arc::new(ProxmoxClient::new(&config));
        let converter = ImageConverter::new(std::env::temp_dir(), Arc::clone(&proxmox));
        let backend = LxcBackend::new(proxmox, converter);
        assert_eq!(
            backend.ostemplate_ref("alpine-3.19.tar.zst"),
            "local:vztmpl/alpine-3.19.tar.zst"
        );
        assert_eq!(
            backend.ostemplate_ref("other:vztmpl/alpine-3.19.tar.zst"),
            "other:vztmpl/alpine-3.19.tar.zst"
        );
    }
}
