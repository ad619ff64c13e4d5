//! Turns an OCI bundle into a Proxmox LXC template: extract rootfs, apply
//! LXC shaping, pack as `.tar.zst`, upload, and remember the result so a
//! second request for the same bundle is a cache hit instead of a second
//! upload.
//!
//! Concurrent conversions of the *same* bundle are serialized through a
//! per-digest lock, the same lazy-single-connection idea the Proxmox guest
//! agent client uses for its socket — here keyed by digest instead of by
//! VM, since many callers can race to convert one image.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::proxmox::ProxmoxClient;

/// Default storage target for uploaded templates.
const DEFAULT_STORAGE: &str = "local";

/// Tracks in-flight and completed conversions so concurrent callers never
/// upload the same content twice and a repeat call after completion is a
/// pure cache hit.
pub struct ImageConverter {
    scratch_root: PathBuf,
    proxmox: Arc<ProxmoxClient>,
    storage: String,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    completed: StdMutex<HashMap<String, String>>,
}

impl ImageConverter {
    /// Builds a converter that uses `scratch_root` for extraction
    /// workspaces and uploads through `proxmox`.
    #[must_use]
    pub fn new(scratch_root: impl Into<PathBuf>, proxmox: Arc<ProxmoxClient>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            proxmox,
            storage: DEFAULT_STORAGE.to_string(),
            locks: StdMutex::new(HashMap::new()),
            completed: StdMutex::new(HashMap::new()),
        }
    }

    /// Overrides the Proxmox storage target templates upload into.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    /// The Proxmox storage target templates are uploaded into.
    #[must_use]
    pub fn storage(&self) -> &str {
        &self.storage
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Converts the bundle at `bundle_path` into an uploaded LXC template
    /// for `container_name`, returning its template name. If a prior call
    /// in this process already converted this exact bundle, or the
    /// template is already present on the configured storage, returns
    /// the existing template name without doing any work.
    ///
    /// Pipeline: parse bundle -> derive template name from the image
    /// reference (or `{container_name}-{unix_seconds}` when absent) ->
    /// in-process cache check -> remote storage check -> acquire
    /// per-key lock -> re-check both caches (another caller, in this
    /// process or another, may have finished while we waited) ->
    /// extract rootfs -> apply LXC shaping -> pack as `.tar.zst` ->
    /// upload -> record in cache -> clean up the scratch directory on
    /// every exit path.
    pub async fn convert(&self, bundle_path: &Path, container_name: &str) -> Result<String> {
        let bundle = nexcage_oci::parse_bundle(bundle_path)?;
        let template_name = derive_template_name(&bundle, container_name)?;

        if let Some(cached) = self.cached(&template_name) {
            debug!(template = template_name, "conversion cache hit");
            return Ok(cached);
        }
        if self.exists_on_storage(&template_name).await? {
            debug!(template = template_name, "template already on storage, skipping rebuild");
            self.remember(&template_name);
            return Ok(template_name);
        }

        let lock = self.key_lock(&template_name);
        let _guard = lock.lock().await;

        if let Some(cached) = self.cached(&template_name) {
            debug!(template = template_name, "conversion cache hit after lock wait");
            return Ok(cached);
        }
        if self.exists_on_storage(&template_name).await? {
            debug!(template = template_name, "template appeared on storage while waiting for lock");
            self.remember(&template_name);
            return Ok(template_name);
        }

        let result = self.convert_locked(&bundle, &template_name).await;
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).remove(&template_name);
        result
    }

    /// Queries the configured storage for `template_name`, so a second
    /// *process* converting the same bundle hits the cache instead of
    /// re-uploading.
    async fn exists_on_storage(&self, template_name: &str) -> Result<bool> {
        let proxmox = Arc::clone(&self.proxmox);
        let storage = self.storage.clone();
        let suffix = format!("/{template_name}");
        let templates = tokio::task::spawn_blocking(move || proxmox.list_templates(&storage))
            .await
            .map_err(|e| Error::InternalError(format!("template listing task panicked: {e}")))??;
        Ok(templates.iter().any(|volid| volid.ends_with(&suffix)))
    }

    async fn convert_locked(
        &self,
        bundle: &nexcage_oci::OciBundle,
        template_name: &str,
    ) -> Result<String> {
        let scratch = self.scratch_root.join(format!("convert-{template_name}"));
        let result = self.run_pipeline(bundle, template_name, &scratch).await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        result
    }

    async fn run_pipeline(
        &self,
        bundle: &nexcage_oci::OciBundle,
        template_name: &str,
        scratch: &Path,
    ) -> Result<String> {
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| Error::io(scratch, e))?;

        let rootfs_dst = scratch.join("rootfs");
        nexcage_oci::extract_archive(&bundle.rootfs, &rootfs_dst).map_err(|e| {
            Error::ConversionFailed {
                stage: "extract",
                message: e.to_string(),
            }
        })?;

        let shape = nexcage_oci::to_lxc_config(bundle);
        apply_shape(&rootfs_dst, &shape)?;

        let packed = scratch.join(format!("{template_name}.tar.zst"));
        nexcage_oci::pack_archive(&rootfs_dst, &packed, nexcage_oci::Codec::DEFAULT_TEMPLATE_CODEC)
            .map_err(|e| Error::ConversionFailed {
                stage: "pack",
                message: e.to_string(),
            })?;

        let proxmox = Arc::clone(&self.proxmox);
        let storage = self.storage.clone();
        let packed_clone = packed.clone();
        tokio::task::spawn_blocking(move || proxmox.upload_template(&storage, &packed_clone))
            .await
            .map_err(|e| Error::InternalError(format!("upload task panicked: {e}")))?
            .map_err(|e| Error::ConversionFailed {
                stage: "upload",
                message: e.to_string(),
            })?;

        self.remember(template_name);
        info!(template = template_name, "converted and uploaded image");
        Ok(template_name.to_string())
    }

    fn cached(&self, template_name: &str) -> Option<String> {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(template_name)
            .cloned()
    }

    fn remember(&self, template_name: &str) {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template_name.to_string(), template_name.to_string());
    }
}

/// Derives a stable template name from the bundle's image reference
/// annotation, falling back to `{container_name}-{unix_seconds}` when
/// the annotation is absent.
fn derive_template_name(bundle: &nexcage_oci::OciBundle, container_name: &str) -> Result<String> {
    if let Some(image_ref) = nexcage_oci::extract_image_ref(bundle) {
        return Ok(sanitize_template_name(image_ref));
    }
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(sanitize_template_name(&format!("{container_name}-{unix_seconds}")))
}

fn sanitize_template_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{cleaned}.tar.zst")
}

/// Directories every LXC rootfs needs present before `pct restore` takes
/// it over; cgroup/namespace limits themselves are applied by Proxmox at
/// container creation, not by this crate.
const LXC_SKELETON_DIRS: &[&str] = &["dev", "proc", "sys", "tmp", "var/run"];

/// Shapes an extracted rootfs into something `pct restore` can run:
/// the directories LXC mounts over at start, `/etc/hostname`, a minimal
/// `/etc/network/interfaces` for `eth0`, and an executable `/sbin/init`.
fn apply_shape(rootfs: &Path, shape: &nexcage_oci::LxcShapeConfig) -> Result<()> {
    for dir in LXC_SKELETON_DIRS {
        let path = rootfs.join(dir);
        std::fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
    }

    let hostname_path = rootfs.join("etc/hostname");
    if let Some(parent) = hostname_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(&hostname_path, format!("{}\n", shape.hostname))
        .map_err(|e| Error::io(&hostname_path, e))?;

    let interfaces_path = rootfs.join("etc/network/interfaces");
    if let Some(parent) = interfaces_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(
        &interfaces_path,
        "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet dhcp\n",
    )
    .map_err(|e| Error::io(&interfaces_path, e))?;

    let init_path = rootfs.join("sbin/init");
    if init_path.is_file() {
        ensure_executable(&init_path)?;
    }

    Ok(())
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let mut perms = std::fs::metadata(path).map_err(|e| Error::io(path, e))?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms).map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_template_name_replaces_reserved_characters() {
        assert_eq!(
            sanitize_template_name("docker.io/library/alpine:3.19"),
            "docker-io-library-alpine-3-19.tar.zst"
        );
    }

    #[test]
    fn apply_shape_writes_the_expected_skeleton() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("sbin")).expect("mkdir sbin");
        std::fs::write(rootfs.join("sbin/init"), b"#!/bin/sh\n").expect("write init");

        let bundle_dir = dir.path().join("bundle");
        std::fs::create_dir_all(bundle_dir.join("rootfs")).expect("mkdir bundle rootfs");
        std::fs::write(
            bundle_dir.join("config.json"),
            r#"{"ociVersion":"1.0.2","hostname":"web-01","process":{"args":["/bin/sh"],"cwd":"/"},"root":{"path":"rootfs"}}"#,
        )
        .expect("write config");
        let bundle = nexcage_oci::parse_bundle(&bundle_dir).expect("parse bundle");
        let shape = nexcage_oci::to_lxc_config(&bundle);

        apply_shape(&rootfs, &shape).expect("apply_shape");

        for sub in LXC_SKELETON_DIRS {
            assert!(rootfs.join(sub).is_dir(), "missing {sub}");
        }
        assert_eq!(
            std::fs::read_to_string(rootfs.join("etc/hostname")).expect("read hostname"),
            "web-01\n"
        );
        assert!(rootfs.join("etc/network/interfaces").is_file());
    }

    #[tokio::test]
    async fn convert_is_a_cache_hit_on_repeat_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle_dir = dir.path().join("bundle");
        std::fs::create_dir_all(bundle_dir.join("rootfs")).expect("mkdir rootfs");
        std::fs::write(
            bundle_dir.join("config.json"),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"],"cwd":"/"},"root":{"path":"rootfs"}}"#,
        )
        .expect("write config");

        let config = crate::config::ProxmoxConfig::default();
        let proxmox = Arc::new(ProxmoxClient::new(&config));
        let converter = ImageConverter::new(dir.path().join("scratch"), proxmox);

        // Pre-seed the completed cache to avoid driving a real network
        // upload from a unit test; this exercises the cache-hit path that
        // `convert` takes before acquiring the per-key lock, and before
        // the remote storage check that would otherwise shell out to
        // `pvesm`.
        let bundle = nexcage_oci::parse_bundle(&bundle_dir).expect("parse bundle");
        let name = derive_template_name(&bundle, "web-01").expect("derive name");
        converter
            .completed
            .lock()
            .unwrap()
            .insert(name.clone(), name.clone());

        let result = converter.convert(&bundle_dir, "web-01").await.expect("convert");
        assert_eq!(result, name);
    }
}
