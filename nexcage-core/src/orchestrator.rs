//! The thin lifecycle orchestrator: builds state, enforces the lifecycle
//! state machine, and is the only caller of [`crate::router::Router`].

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::router::Router;
use crate::sandbox::SandboxConfig;
use crate::state::{ContainerState, ContainerStatus};

/// Drives container lifecycle transitions against a [`Router`], persisting
/// [`ContainerState`] under `root` as `<root>/<id>/state.json`.
pub struct Orchestrator {
    root: PathBuf,
    router: Router,
}

impl Orchestrator {
    /// Builds an orchestrator persisting state under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, router: Router) -> Self {
        Self {
            root: root.into(),
            router,
        }
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn load_state(&self, id: &str) -> Result<ContainerState> {
        ContainerState::load(&self.container_dir(id))
            .map_err(|_| Error::NotFound(format!("container {id}")))
    }

    fn save_state(&self, state: &ContainerState) -> Result<()> {
        state
            .save(&self.container_dir(&state.id))
            .map_err(|e| Error::io(self.container_dir(&state.id), e))
    }

    /// Creates a container: routes `cfg.name`, delegates to the selected
    /// backend, then persists `Created` state. Fails with `AlreadyExists`
    /// if state already exists for this name.
    pub fn create(&self, cfg: &SandboxConfig) -> Result<()> {
        let dir = self.container_dir(&cfg.name);
        if dir.join("state.json").exists() {
            return Err(Error::AlreadyExists(format!("container {}", cfg.name)));
        }
        let kind = self.router.create(cfg)?;
        let bundle_path = cfg.image.as_ref().map(PathBuf::from).filter(|p| p.is_dir());
        let state = ContainerState::new(&cfg.name, kind, bundle_path);
        self.save_state(&state)?;
        info!(container = cfg.name, "container created");
        Ok(())
    }

    /// Starts `id`. Valid from `created` or `stopped`; idempotent from
    /// `running`.
    pub fn start(&self, id: &str) -> Result<()> {
        let mut state = self.load_state(id)?;
        if state.status == ContainerStatus::Running {
            return Ok(());
        }
        self.router.start(id, state.backend)?;
        state.status = ContainerStatus::Running;
        self.save_state(&state)
    }

    /// Stops `id`. Valid from `running`; idempotent from `stopped`.
    pub fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.load_state(id)?;
        if state.status == ContainerStatus::Stopped {
            return Ok(());
        }
        self.router.stop(id, state.backend)?;
        state.status = ContainerStatus::Stopped;
        self.save_state(&state)
    }

    /// Deletes `id`. Valid from any non-running state; from `running`
    /// requires `force`, which stops the container first.
    pub fn delete(&self, id: &str, force: bool) -> Result<()> {
        let state = self.load_state(id)?;
        if state.status == ContainerStatus::Running {
            if !force {
                return Err(Error::LayerInUse(format!(
                    "container {id} is running; delete requires --force"
                )));
            }
            self.router.stop(id, state.backend)?;
        }
        self.router.delete(id, state.backend)?;
        let dir = self.container_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        info!(container = id, "container deleted");
        Ok(())
    }

    /// Lists every container this orchestrator manages, across backends.
    pub fn list(&self) -> Result<Vec<crate::backend::ContainerInfo>> {
        self.router.list()
    }

    /// Describes `id`, using the backend it was originally routed to.
    pub fn info(&self, id: &str) -> Result<crate::backend::ContainerInfo> {
        let state = self.load_state(id)?;
        self.router.info(id, state.backend)
    }

    /// Runs `argv` inside `id`. Valid only while the container is running.
    pub fn exec(&self, id: &str, argv: &[String]) -> Result<crate::backend::ExecResult> {
        let state = self.load_state(id)?;
        if state.status != ContainerStatus::Running {
            return Err(Error::UsageError(format!(
                "container {id} is not running"
            )));
        }
        self.router.exec(id, state.backend, argv)
    }
}

/// Builds the default state root if `config.json` didn't set one.
#[must_use]
pub fn default_root() -> &'static Path {
    Path::new("/var/lib/nexcage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ContainerRoutingConfig};
    use crate::proxmox::ProxmoxClient;
    use crate::router::build_router;
    use std::sync::Arc;

    fn orchestrator_in(dir: &Path) -> Orchestrator {
        let config = Config {
            runtime: crate::config::RuntimeConfig {
                log_level: "info".to_string(),
                root_path: dir.to_path_buf(),
            },
            container_config: ContainerRoutingConfig::default(),
            ..Config::default()
        };
        let proxmox = Arc::new(ProxmoxClient::new(&config.proxmox));
        let layerfs = Arc::new(crate::layerfs::LayerFS::open(dir.join("layers"), 16).expect("open layerfs"));
        let router = build_router(&config, proxmox, layerfs);
        Orchestrator::new(dir.join("state"), router)
    }

    #[test]
    fn stop_before_create_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator_in(dir.path());
        assert!(matches!(orch.stop("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn delete_without_force_on_running_is_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator_in(dir.path());
        let state = ContainerState {
            status: ContainerStatus::Running,
            ..ContainerState::new("web-01", crate::sandbox::ContainerType::Lxc, None)
        };
        state.save(&dir.path().join("state").join("web-01")).expect("save");
        assert!(matches!(
            orch.delete("web-01", false),
            Err(Error::LayerInUse(_))
        ));
    }
}
