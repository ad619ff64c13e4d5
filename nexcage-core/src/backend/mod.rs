//! The uniform backend contract every container implementation exposes,
//! plus the three concrete implementations it is routed to.

pub mod lxc;
pub mod oci_runtime;
pub mod vm;

use crate::error::Result;
use crate::sandbox::{ContainerType, SandboxConfig};
use crate::state::ContainerStatus;

/// Snapshot of a container's observable state, returned by `list`/`info`.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Container name.
    pub name: String,
    /// Which backend owns it.
    pub backend: ContainerType,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// VMID (LXC/VM) or host PID (OCI runtime), if known.
    pub pid: Option<u32>,
    /// IP address, if the backend can report one.
    pub ip: Option<String>,
}

/// Outcome of a one-shot `exec` call.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

/// The contract every container backend implements. The router is the
/// only caller; backends never see each other and never translate their
/// own errors into the shared taxonomy — that's the router's job.
pub trait Backend {
    /// Creates a container per `cfg`. Must be called from no prior state;
    /// callers are responsible for checking `AlreadyExists` first.
    fn create(&self, cfg: &SandboxConfig) -> Result<()>;
    /// Starts a previously created container.
    fn start(&self, id: &str) -> Result<()>;
    /// Stops a running container.
    fn stop(&self, id: &str) -> Result<()>;
    /// Deletes a container. Callers enforce the "running needs force"
    /// rule before calling this; backends just delete what's asked.
    fn delete(&self, id: &str) -> Result<()>;
    /// Lists every container this backend currently manages.
    fn list(&self) -> Result<Vec<ContainerInfo>>;
    /// Describes one container by name.
    fn info(&self, id: &str) -> Result<ContainerInfo>;
    /// Runs `argv` inside a running container and captures its output.
    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecResult>;
}
