//! Container state types and JSON persistence.
//!
//! State is one flat JSON file per container at `<root>/<id>/state.json`,
//! per the documented State Directory Layout — there is no embedded
//! database; each container's lifecycle fits in a handful of fields.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::sandbox::ContainerType;

/// Container lifecycle status, observable through `list`/`info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ContainerStatus {
    /// `create` succeeded; the container has never been started.
    Created,
    /// The container's process (or LXC/VM) is running.
    Running,
    /// The container was started and has since stopped.
    Stopped,
    /// Suspended (QEMU `qm suspend`); not observable on LXC.
    Paused,
}

/// Persisted state of a managed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContainerState {
    /// Container id (matches `^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$`).
    pub id: String,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// Which backend owns this container.
    pub backend: ContainerType,
    /// VMID (LXC/VM backends) or host PID (OCI-runtime backend), if known.
    pub pid: Option<u32>,
    /// Absolute path to the source OCI bundle, if one was used to create it.
    pub bundle_path: Option<PathBuf>,
    /// Unix timestamp (seconds) this container was created.
    pub created_unix: u64,
}

impl ContainerState {
    /// Builds a freshly-created container's initial state.
    #[must_use]
    pub fn new(id: impl Into<String>, backend: ContainerType, bundle_path: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            status: ContainerStatus::Created,
            backend,
            pid: None,
            bundle_path,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Loads state from `<dir>/state.json`.
    pub fn load(dir: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(dir.join("state.json"))?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persists state to `<dir>/state.json`, creating `dir` if needed.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let file = fs::File::create(dir.join("state.json"))?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

/// Validates a container id against `^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$`.
#[must_use]
pub fn is_valid_container_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 63 {
        return false;
    }
    let bytes = id.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = ContainerState::new("web-01", ContainerType::Lxc, None);
        state.save(dir.path()).expect("save");
        let loaded = ContainerState::load(dir.path()).expect("load");
        assert_eq!(loaded.id, "web-01");
        assert_eq!(loaded.status, ContainerStatus::Created);
    }

    #[test]
    fn validates_container_ids() {
        assert!(is_valid_container_id("web-01"));
        assert!(is_valid_container_id("a"));
        assert!(!is_valid_container_id(""));
        assert!(!is_valid_container_id("-web"));
        assert!(!is_valid_container_id(&"a".repeat(64)));
    }
}
