//! OCI Runtime Spec bundle parsing and LXC config derivation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum size of `config.json` this parser will read into memory.
const MAX_CONFIG_BYTES: u64 = 10 * 1024 * 1024;

/// Annotation key conventionally carrying the image reference a bundle
/// was built from.
pub const IMAGE_REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A parsed, validated OCI bundle on disk.
#[derive(Debug, Clone)]
pub struct OciBundle {
    /// Absolute path to the bundle directory.
    pub bundle_path: PathBuf,
    /// The parsed and validated `config.json`.
    pub spec: OciSpec,
    /// Absolute rootfs path: `bundle_path` joined with `spec.root.path`
    /// (defaulting to `rootfs`).
    pub rootfs: PathBuf,
    /// Image reference read from the `org.opencontainers.image.ref.name`
    /// annotation, if present.
    pub image_ref: Option<String>,
}

/// Subset of the OCI Runtime Spec v1.0.2 shape this crate consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciSpec {
    /// Must equal `"1.0.2"`.
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    /// Process to run in the container.
    pub process: Option<OciProcess>,
    /// Root filesystem descriptor.
    pub root: Option<OciRoot>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// Additional mounts beyond the rootfs.
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    /// Linux-specific configuration.
    pub linux: Option<OciLinux>,
    /// Free-form annotations; the image-ref convention lives here.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// `process` stanza of a bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciProcess {
    /// Argument vector; required and non-empty when `process` is present.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory; must be absolute when present.
    pub cwd: Option<String>,
}

/// `root` stanza of a bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct OciRoot {
    /// Path to the rootfs, relative to the bundle or absolute; must
    /// contain no `..` components.
    pub path: String,
    /// Whether the rootfs should be mounted read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// One entry of the `mounts` array.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OciMount {
    /// Absolute mount destination inside the container.
    pub destination: String,
    /// Mount type.
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Absolute mount source on the host.
    pub source: Option<String>,
    /// Mount options, passed through opaquely.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Recognized values of [`OciMount::mount_type`].
const ALLOWED_MOUNT_TYPES: &[&str] = &[
    "bind", "proc", "sysfs", "tmpfs", "devpts", "devtmpfs", "overlay",
];

/// `linux` stanza of a bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciLinux {
    /// Namespace list; presence of a `user` namespace implies unprivileged.
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    /// Resource limits.
    pub resources: Option<OciResources>,
}

/// One entry of `linux.namespaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct OciNamespace {
    /// Namespace type, e.g. `"user"`, `"pid"`, `"net"`.
    #[serde(rename = "type")]
    pub ns_type: String,
}

/// `linux.resources` stanza.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciResources {
    /// Memory limits.
    pub memory: Option<OciMemory>,
    /// CPU limits.
    pub cpu: Option<OciCpu>,
}

/// `linux.resources.memory` stanza.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciMemory {
    /// Memory limit in bytes.
    pub limit: Option<i64>,
}

/// `linux.resources.cpu` stanza.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciCpu {
    /// CFS quota in microseconds.
    pub quota: Option<i64>,
    /// CFS period in microseconds.
    pub period: Option<i64>,
}

/// Parses and validates the bundle rooted at `path`.
///
/// Reads `<path>/config.json` (refusing files over 10 MiB), decodes it
/// tolerantly (unknown fields are ignored), validates it per the OCI
/// Runtime Spec subset this crate understands, and confirms both
/// `config.json` and the rootfs directory exist.
pub fn parse_bundle(path: &Path) -> Result<OciBundle> {
    let bundle_path = path.to_path_buf();
    let config_path = bundle_path.join("config.json");

    let meta = std::fs::metadata(&config_path).map_err(|e| Error::io(&config_path, e))?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(Error::InvalidBundle(format!(
            "config.json is {} bytes, exceeds {MAX_CONFIG_BYTES} byte limit",
            meta.len()
        )));
    }

    let raw = std::fs::read(&config_path).map_err(|e| Error::io(&config_path, e))?;
    let spec: OciSpec = serde_json::from_slice(&raw)?;
    validate_spec(&spec)?;

    let root_rel = spec
        .root
        .as_ref()
        .map(|r| r.path.as_str())
        .unwrap_or("rootfs");
    let rootfs = bundle_path.join(root_rel);
    if !rootfs.is_dir() {
        return Err(Error::InvalidBundle(format!(
            "rootfs directory {} does not exist",
            rootfs.display()
        )));
    }

    let image_ref = spec.annotations.get(IMAGE_REF_ANNOTATION).cloned();

    Ok(OciBundle {
        bundle_path,
        spec,
        rootfs,
        image_ref,
    })
}

/// Returns the image reference annotation, if present, without re-parsing.
pub fn extract_image_ref(bundle: &OciBundle) -> Option<&str> {
    bundle.image_ref.as_deref()
}

fn validate_spec(spec: &OciSpec) -> Result<()> {
    if spec.oci_version != "1.0.2" {
        return Err(Error::InvalidBundle(format!(
            "unsupported ociVersion {:?}, expected \"1.0.2\"",
            spec.oci_version
        )));
    }

    if let Some(process) = &spec.process {
        if process.args.is_empty() {
            return Err(Error::InvalidBundle(
                "process.args must be non-empty when process is present".into(),
            ));
        }
        if let Some(cwd) = &process.cwd {
            if !Path::new(cwd).is_absolute() {
                return Err(Error::InvalidBundle(format!(
                    "process.cwd {cwd:?} must be absolute"
                )));
            }
        }
    }

    if let Some(root) = &spec.root {
        let root_path = Path::new(&root.path);
        if root_path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(Error::InvalidBundle(format!(
                "root.path {:?} must not contain '..'",
                root.path
            )));
        }
    }

    if let Some(hostname) = &spec.hostname {
        if !is_valid_hostname(hostname) {
            return Err(Error::InvalidBundle(format!(
                "hostname {hostname:?} is not a valid RFC-952/1123 hostname"
            )));
        }
    }

    for mount in &spec.mounts {
        if !Path::new(&mount.destination).is_absolute() {
            return Err(Error::InvalidBundle(format!(
                "mount destination {:?} must be absolute",
                mount.destination
            )));
        }
        if let Some(mount_type) = &mount.mount_type {
            if !ALLOWED_MOUNT_TYPES.contains(&mount_type.as_str()) {
                return Err(Error::InvalidBundle(format!(
                    "unsupported mount type {mount_type:?}"
                )));
            }
        }
        if let Some(source) = &mount.source {
            if !Path::new(source).is_absolute() {
                return Err(Error::InvalidBundle(format!(
                    "mount source {source:?} must be absolute"
                )));
            }
        }
    }

    Ok(())
}

/// Validates `name` against RFC-952/1123: at most 63 octets, alphanumeric
/// with interior hyphens, first and last character alphanumeric.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_alphanumeric();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// Whether a user namespace is declared, implying an unprivileged container.
fn declares_user_namespace(spec: &OciSpec) -> bool {
    spec.linux
        .as_ref()
        .is_some_and(|l| l.namespaces.iter().any(|ns| ns.ns_type == "user"))
}

/// LXC-flavored configuration derived from a parsed bundle.
#[derive(Debug, Clone, Serialize)]
pub struct LxcShapeConfig {
    /// Container hostname, from the spec or `"container"`.
    pub hostname: String,
    /// Absolute rootfs path.
    pub rootfs: PathBuf,
    /// Command to run; `process.args` or `["/bin/sh"]`.
    pub command: Vec<String>,
    /// Environment; `process.env` or a default `PATH`+`TERM` pair.
    pub env: Vec<String>,
    /// Mounts, deep-copied from the spec.
    pub mounts: Vec<OciMount>,
    /// Memory limit in MiB, if `linux.resources.memory.limit` was set.
    pub memory_mib: Option<u64>,
    /// CPU core count, derived as `floor(quota / period)`.
    pub cpu_cores: Option<u32>,
    /// True iff a user namespace is declared.
    pub unprivileged: bool,
    /// LXC feature flags (`nesting`, `keyctl`).
    pub features: HashMap<String, u8>,
}

/// Derives an LXC-flavored configuration from a parsed bundle.
pub fn to_lxc_config(bundle: &OciBundle) -> LxcShapeConfig {
    let spec = &bundle.spec;

    let hostname = spec.hostname.clone().unwrap_or_else(|| "container".to_string());

    let command = spec
        .process
        .as_ref()
        .map(|p| p.args.clone())
        .filter(|args| !args.is_empty())
        .unwrap_or_else(|| vec!["/bin/sh".to_string()]);

    let env = spec
        .process
        .as_ref()
        .map(|p| p.env.clone())
        .filter(|env| !env.is_empty())
        .unwrap_or_else(|| {
            vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                "TERM=xterm".to_string(),
            ]
        });

    let resources = spec.linux.as_ref().and_then(|l| l.resources.as_ref());
    let memory_mib = resources
        .and_then(|r| r.memory.as_ref())
        .and_then(|m| m.limit)
        .filter(|&limit| limit > 0)
        .map(|limit| (limit as u64) / (1 << 20));
    let cpu_cores = resources.and_then(|r| r.cpu.as_ref()).and_then(|cpu| {
        match (cpu.quota, cpu.period) {
            (Some(quota), Some(period)) if period > 0 => Some((quota / period) as u32),
            _ => None,
        }
    });

    let unprivileged = declares_user_namespace(spec);

    let mut features = HashMap::new();
    features.insert("nesting".to_string(), 1u8);
    if unprivileged {
        features.insert("keyctl".to_string(), 1u8);
    }

    LxcShapeConfig {
        hostname,
        rootfs: bundle.rootfs.clone(),
        command,
        env,
        mounts: spec.mounts.clone(),
        memory_mib,
        cpu_cores,
        unprivileged,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, config_json: &str) {
        std::fs::write(dir.join("config.json"), config_json).expect("write config");
        std::fs::create_dir_all(dir.join("rootfs")).expect("mkdir rootfs");
    }

    #[test]
    fn parses_minimal_valid_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(
            dir.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"hostname":"web01"}"#,
        );
        let bundle = parse_bundle(dir.path()).expect("parse");
        assert_eq!(bundle.spec.hostname.as_deref(), Some("web01"));
        assert_eq!(bundle.rootfs, dir.path().join("rootfs"));
    }

    #[test]
    fn parse_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(
            dir.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/usr/sbin/nginx","-g","daemon off;"]}}"#,
        );
        let a = parse_bundle(dir.path()).expect("parse a");
        let b = parse_bundle(dir.path()).expect("parse b");
        assert_eq!(a.spec.process.unwrap().args, b.spec.process.unwrap().args);
        assert_eq!(a.rootfs, b.rootfs);
    }

    #[test]
    fn rejects_wrong_oci_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), r#"{"ociVersion":"1.1.0"}"#);
        let err = parse_bundle(dir.path()).unwrap_err();
        match err {
            Error::InvalidBundle(msg) => assert!(msg.contains("ociVersion")),
            other => panic!("expected InvalidBundle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_process_args() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), r#"{"ociVersion":"1.0.2","process":{"args":[]}}"#);
        assert!(parse_bundle(dir.path()).is_err());
    }

    #[test]
    fn extracts_image_ref_annotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(
            dir.path(),
            r#"{"ociVersion":"1.0.2","annotations":{"org.opencontainers.image.ref.name":"nginx-1.25"}}"#,
        );
        let bundle = parse_bundle(dir.path()).expect("parse");
        assert_eq!(extract_image_ref(&bundle), Some("nginx-1.25"));
    }

    #[test]
    fn to_lxc_config_derives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(
            dir.path(),
            r#"{"ociVersion":"1.0.2","linux":{"namespaces":[{"type":"user"}],"resources":{"memory":{"limit":268435456},"cpu":{"quota":200000,"period":100000}}}}"#,
        );
        let bundle = parse_bundle(dir.path()).expect("parse");
        let cfg = to_lxc_config(&bundle);
        assert_eq!(cfg.hostname, "container");
        assert_eq!(cfg.command, vec!["/bin/sh".to_string()]);
        assert!(cfg.unprivileged);
        assert_eq!(cfg.memory_mib, Some(256));
        assert_eq!(cfg.cpu_cores, Some(2));
        assert_eq!(cfg.features.get("keyctl"), Some(&1));
    }

    #[test]
    fn rejects_missing_rootfs_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), r#"{"ociVersion":"1.0.2"}"#)
            .expect("write");
        assert!(parse_bundle(dir.path()).is_err());
    }

    #[test]
    fn hostname_validation() {
        assert!(is_valid_hostname("web01"));
        assert!(is_valid_hostname("a"));
        assert!(!is_valid_hostname("-bad"));
        assert!(!is_valid_hostname("bad-"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname(&"a".repeat(64)));
    }
}
