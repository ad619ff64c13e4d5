//! Routes a container name to a [`ContainerType`] and dispatches lifecycle
//! operations to the matching [`Backend`]. The router is the single point
//! where backend-native errors cross into the shared taxonomy; backends
//! themselves never translate their own errors.

use std::sync::Arc;

use crate::backend::{Backend, ContainerInfo, ExecResult};
use crate::backend::lxc::LxcBackend;
use crate::backend::oci_runtime::OciRuntimeBackend;
use crate::backend::vm::VmBackend;
use crate::config::ContainerRoutingConfig;
use crate::error::{Error, Result};
use crate::sandbox::{ContainerType, SandboxConfig};

/// Matches `name` against `patterns` in order, `*` as a wildcard matching
/// any run of characters, case-sensitive, first hit wins. Falls back to
/// `default_type` when nothing matches.
#[must_use]
pub fn route(name: &str, config: &ContainerRoutingConfig) -> ContainerType {
    for pattern in &config.crun_name_patterns {
        if glob_match(pattern, name) {
            return ContainerType::OciRuntime;
        }
    }
    config.default_container_type
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    match_from(pattern, text)
}

fn match_from(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => {
            match_from(rest, text) || (!text.is_empty() && match_from(pattern, &text[1..]))
        }
        Some((&p, rest)) => !text.is_empty() && text[0] == p && match_from(rest, &text[1..]),
    }
}

/// Holds one instance of every backend and dispatches to whichever one
/// `route` selects.
pub struct Router {
    routing: ContainerRoutingConfig,
    lxc: LxcBackend,
    oci_runtime: OciRuntimeBackend,
    vm: VmBackend,
}

impl Router {
    /// Builds a router from the three concrete backends and the routing
    /// config that picks among them for a given container name.
    #[must_use]
    pub fn new(
        routing: ContainerRoutingConfig,
        lxc: LxcBackend,
        oci_runtime: OciRuntimeBackend,
        vm: VmBackend,
    ) -> Self {
        Self {
            routing,
            lxc,
            oci_runtime,
            vm,
        }
    }

    /// Routes `name` to a `ContainerType` without dispatching anything.
    #[must_use]
    pub fn route(&self, name: &str) -> ContainerType {
        route(name, &self.routing)
    }

    fn unsupported() -> Error {
        Error::UnsupportedBackend("no backend configured for this container".to_string())
    }

    /// Routes `cfg.name` and creates the container on the selected backend.
    ///
    /// Dispatches on the tagged `ContainerType` rather than through a
    /// `dyn Backend`: the backend set is small and closed, so a match
    /// arm per variant is both the idiom and the whole vtable this needs.
    pub fn create(&self, cfg: &SandboxConfig) -> Result<ContainerType> {
        let kind = self.route(&cfg.name);
        match kind {
            ContainerType::Lxc => self.lxc.create(cfg)?,
            ContainerType::OciRuntime => self.oci_runtime.create(cfg)?,
            ContainerType::Vm => self.vm.create(cfg)?,
            ContainerType::Unknown => return Err(Self::unsupported()),
        }
        Ok(kind)
    }

    /// Starts `id` on the backend it was routed to at creation time.
    pub fn start(&self, id: &str, kind: ContainerType) -> Result<()> {
        match kind {
            ContainerType::Lxc => self.lxc.start(id),
            ContainerType::OciRuntime => self.oci_runtime.start(id),
            ContainerType::Vm => self.vm.start(id),
            ContainerType::Unknown => Err(Self::unsupported()),
        }
    }

    /// Stops `id` on the backend it was routed to at creation time.
    pub fn stop(&self, id: &str, kind: ContainerType) -> Result<()> {
        match kind {
            ContainerType::Lxc => self.lxc.stop(id),
            ContainerType::OciRuntime => self.oci_runtime.stop(id),
            ContainerType::Vm => self.vm.stop(id),
            ContainerType::Unknown => Err(Self::unsupported()),
        }
    }

    /// Deletes `id` on the backend it was routed to at creation time.
    pub fn delete(&self, id: &str, kind: ContainerType) -> Result<()> {
        match kind {
            ContainerType::Lxc => self.lxc.delete(id),
            ContainerType::OciRuntime => self.oci_runtime.delete(id),
            ContainerType::Vm => self.vm.delete(id),
            ContainerType::Unknown => Err(Self::unsupported()),
        }
    }

    /// Lists containers across every backend.
    pub fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut all = self.lxc.list()?;
        all.extend(self.oci_runtime.list()?);
        all.extend(self.vm.list()?);
        Ok(all)
    }

    /// Describes `id` on the backend it was routed to at creation time.
    pub fn info(&self, id: &str, kind: ContainerType) -> Result<ContainerInfo> {
        match kind {
            ContainerType::Lxc => self.lxc.info(id),
            ContainerType::OciRuntime => self.oci_runtime.info(id),
            ContainerType::Vm => self.vm.info(id),
            ContainerType::Unknown => Err(Self::unsupported()),
        }
    }

    /// Runs `argv` inside `id` on the backend it was routed to at creation time.
    pub fn exec(&self, id: &str, kind: ContainerType, argv: &[String]) -> Result<ExecResult> {
        match kind {
            ContainerType::Lxc => self.lxc.exec(id, argv),
            ContainerType::OciRuntime => self.oci_runtime.exec(id, argv),
            ContainerType::Vm => self.vm.exec(id, argv),
            ContainerType::Unknown => Err(Self::unsupported()),
        }
    }
}

/// Builds the three concrete backends sharing one [`crate::proxmox::ProxmoxClient`]
/// and [`crate::image_converter::ImageConverter`], wired together as a [`Router`].
#[must_use]
pub fn build_router(
    config: &crate::config::Config,
    proxmox: Arc<crate::proxmox::ProxmoxClient>,
    layerfs: Arc<crate::layerfs::LayerFS>,
) -> Router {
    let converter = crate::image_converter::ImageConverter::new(
        config.runtime.root_path.join("scratch"),
        Arc::clone(&proxmox),
    );
    let lxc = LxcBackend::new(Arc::clone(&proxmox), converter);
    let oci_runtime = OciRuntimeBackend::new(
        "crun",
        Some(config.runtime.root_path.join("oci-runtime")),
        layerfs,
    );
    let vm = VmBackend::new(proxmox);
    Router::new(config.container_config.clone(), lxc, oci_runtime, vm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_with(patterns: &[&str]) -> ContainerRoutingConfig {
        ContainerRoutingConfig {
            crun_name_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            default_container_type: ContainerType::Lxc,
        }
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let routing = routing_with(&["crun-*"]);
        assert_eq!(route("web-01", &routing), ContainerType::Lxc);
    }

    #[test]
    fn matches_wildcard_pattern() {
        let routing = routing_with(&["crun-*"]);
        assert_eq!(route("crun-worker-3", &routing), ContainerType::OciRuntime);
    }

    #[test]
    fn first_pattern_wins() {
        let routing = routing_with(&["crun-*", "*"]);
        assert_eq!(route("vm-anything", &routing), ContainerType::OciRuntime);
    }

    #[test]
    fn glob_is_case_sensitive() {
        let routing = routing_with(&["CRUN-*"]);
        assert_eq!(route("crun-worker", &routing), ContainerType::Lxc);
    }

    #[test]
    fn route_is_deterministic() {
        let routing = routing_with(&["crun-*", "job-*"]);
        for _ in 0..5 {
            assert_eq!(route("job-42", &routing), ContainerType::OciRuntime);
        }
    }
}
