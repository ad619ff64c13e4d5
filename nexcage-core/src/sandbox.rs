//! The normalized request type passed to every backend.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::is_valid_container_id;

/// Which backend owns a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContainerType {
    /// Proxmox LXC container, via `pct`/the HTTP API.
    Lxc,
    /// The userspace OCI runtime (crun-like).
    OciRuntime,
    /// Proxmox VM, via `qm`/the HTTP API.
    Vm,
    /// No configured pattern matched and no default applies.
    Unknown,
}

/// Transport protocol for a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// One `host:container` port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port on the Proxmox host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
    /// Host IP to bind, if restricting beyond all interfaces.
    pub host_ip: Option<String>,
}

/// One bind-mounted volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Absolute path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: PathBuf,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Resource limits applied at container creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in MiB.
    pub memory_mib: Option<u32>,
    /// Number of CPU cores.
    pub cpu_cores: Option<u32>,
    /// Disk size in GiB.
    pub disk_gib: Option<u32>,
}

/// Network configuration applied at container creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bridge name, e.g. `vmbr0`.
    pub bridge: String,
    /// Static IP in CIDR form, if not using DHCP.
    pub ip: Option<String>,
    /// MAC address override.
    pub mac: Option<String>,
}

/// Security-related configuration applied at container creation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Whether the container runs unprivileged.
    pub unprivileged: bool,
}

/// The normalized request passed to all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container name; `^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$`.
    pub name: String,
    /// Image reference: either a bundle directory path, or a backend-understood label.
    pub image: Option<String>,
    /// Command to run, in order.
    pub command: Option<Vec<String>>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Environment variables; keys must be unique.
    pub env: Option<BTreeMap<String, String>>,
    /// Port mappings, in declaration order.
    pub ports: Vec<PortMapping>,
    /// Volume mounts, in declaration order.
    pub volumes: Vec<VolumeMount>,
    /// Resource limits.
    pub resources: Option<ResourceLimits>,
    /// Network configuration.
    pub network: Option<NetworkConfig>,
    /// Security configuration.
    pub security: SecurityConfig,
}

impl SandboxConfig {
    /// Validates the invariants documented for `SandboxConfig`: name shape,
    /// port ranges, and positive resource limits.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_container_id(&self.name) {
            return Err(Error::UsageError(format!(
                "container name {:?} must match ^[A-Za-z0-9][A-Za-z0-9_-]{{0,62}}$",
                self.name
            )));
        }
        for port in &self.ports {
            if port.host_port == 0 || port.container_port == 0 {
                return Err(Error::UsageError(
                    "port numbers must be in 1..=65535".to_string(),
                ));
            }
        }
        if let Some(limits) = &self.resources {
            if limits.memory_mib.is_some_and(|m| m == 0)
                || limits.cpu_cores.is_some_and(|c| c == 0)
                || limits.disk_gib.is_some_and(|d| d == 0)
            {
                return Err(Error::UsageError(
                    "resource limits must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(name: &str) -> SandboxConfig {
        SandboxConfig {
            name: name.to_string(),
            image: None,
            command: None,
            workdir: None,
            env: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            resources: None,
            network: None,
            security: SecurityConfig::default(),
        }
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(base_config("-bad").validate().is_err());
        assert!(base_config("ok-name_1").validate().is_ok());
    }

    #[test]
    fn rejects_zero_resource_limits() {
        let mut cfg = base_config("web-01");
        cfg.resources = Some(ResourceLimits {
            memory_mib: Some(0),
            cpu_cores: None,
            disk_gib: None,
        });
        assert!(cfg.validate().is_err());
    }
}
