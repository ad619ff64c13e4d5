//! Central error taxonomy and CLI exit-code mapping.

/// Alias for `Result<T, nexcage_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy shared by every component: the LayerFS, the image
/// converter, the Proxmox control client, the backends, and the router.
/// The router is the single place that wraps backend-native errors into
/// these variants; every other layer propagates them unchanged.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// CLI argument shape was wrong.
    #[error("usage error: {0}")]
    UsageError(String),

    /// Container, VMID, layer, or bundle missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name or duplicate digest.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// OCI spec validation failed.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// Archive path escape or unsupported codec.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// Layer content didn't match its declared digest.
    #[error("digest mismatch for {digest}: expected content to hash to it, got {actual}")]
    DigestMismatch {
        /// The digest the layer declared.
        digest: String,
        /// The digest actually computed from storage.
        actual: String,
    },

    /// The layer dependency graph has a cycle.
    #[error("circular dependency detected among layers: {0:?}")]
    CircularDependency(Vec<String>),

    /// A layer that is mounted or referenced by another layer was asked
    /// to be removed.
    #[error("layer {0} is in use and cannot be removed")]
    LayerInUse(String),

    /// A mutating call was made against a read-only LayerFS.
    #[error("layer store is read-only")]
    ReadOnly,

    /// A mount-point or overlay operation was attempted twice for the
    /// same digest, or attempted against an unmounted digest.
    #[error("invalid overlay operation on {0}: {1}")]
    InvalidOverlay(String, String),

    /// Image conversion failed at a specific stage.
    #[error("conversion failed at stage {stage}: {message}")]
    ConversionFailed {
        /// Which pipeline stage failed (`"extract"`, `"pack"`, `"shape"`).
        stage: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// Proxmox HTTP API returned a non-2xx response.
    #[error("proxmox API error: HTTP {status}: {body_excerpt}")]
    ProxmoxApiError {
        /// HTTP status code.
        status: u16,
        /// First portion of the response body, for diagnostics.
        body_excerpt: String,
    },

    /// `pct`/`qm` exited non-zero.
    #[error("proxmox CLI error: exit code {exit_code}: {stderr_excerpt}")]
    ProxmoxCliError {
        /// Digest of the argv that was run, for correlating with logs
        /// without leaking secrets embedded in arguments.
        argv_digest: String,
        /// Process exit code, or -1 on timeout.
        exit_code: i32,
        /// First portion of stderr, for diagnostics.
        stderr_excerpt: String,
    },

    /// `pct`, `qm`, or the configured OCI runtime binary isn't on disk.
    #[error("required tool missing: {name}")]
    ToolMissing {
        /// Name of the missing binary.
        name: String,
    },

    /// Network or TLS failure reaching Proxmox.
    #[error("proxmox host unreachable: {0}")]
    Unreachable(String),

    /// HTTP or subprocess deadline exceeded.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The router selected a `ContainerType` the backend doesn't implement.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// An invariant was violated; never silently swallowed.
    #[error("internal error: {0}")]
    InternalError(String),

    /// I/O failure, tagged with the path being operated on when known.
    #[error("io error on {path}: {source}")]
    IoError {
        /// Path being read, written, or walked when the error occurred.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Archive/bundle errors from [`nexcage_oci`] pass through unchanged
    /// and are classified by the router when they cross into the
    /// taxonomy above.
    #[error(transparent)]
    Oci(#[from] nexcage_oci::Error),

    /// `config.json` or `state.json` failed to deserialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an I/O error with the path that was being operated on.
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// The CLI exit code this error maps to, per the documented taxonomy.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UsageError(_) => 2,
            Self::UnsupportedBackend(_) => 64,
            Self::NotFound(_) => 65,
            Self::AlreadyExists(_) | Self::LayerInUse(_) => 66,
            Self::InvalidBundle(_) => 71,
            Self::InvalidArchive(_) => 74,
            Self::IoError { .. } => 74,
            Self::Oci(inner) => oci_exit_code(inner),
            Self::DigestMismatch { .. }
            | Self::CircularDependency(_)
            | Self::ReadOnly
            | Self::InvalidOverlay(..)
            | Self::ConversionFailed { .. }
            | Self::ProxmoxApiError { .. }
            | Self::ProxmoxCliError { .. }
            | Self::ToolMissing { .. }
            | Self::Unreachable(_)
            | Self::Timeout(_)
            | Self::InternalError(_)
            | Self::Json(_) => 70,
        }
    }
}

fn oci_exit_code(err: &nexcage_oci::Error) -> i32 {
    match err {
        nexcage_oci::Error::InvalidBundle(_) => 71,
        nexcage_oci::Error::InvalidArchive(_) | nexcage_oci::Error::UnsupportedFormat(_) => 74,
        _ => 70,
    }
}

/// Scrubs a Proxmox API token (`PVEAPIToken=user@realm!id=secret`) from a
/// string before it reaches the logger.
#[must_use]
pub fn scrub_secrets(input: &str) -> String {
    match input.find("PVEAPIToken=") {
        Some(start) => {
            let end = input[start..]
                .find(char::is_whitespace)
                .map_or(input.len(), |rel| start + rel);
            format!("{}PVEAPIToken=<redacted>{}", &input[..start], &input[end..])
        }
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(Error::UsageError("x".into()).exit_code(), 2);
        assert_eq!(Error::NotFound("x".into()).exit_code(), 65);
        assert_eq!(Error::AlreadyExists("x".into()).exit_code(), 66);
        assert_eq!(Error::InvalidBundle("x".into()).exit_code(), 71);
        assert_eq!(Error::InvalidArchive("x".into()).exit_code(), 74);
        assert_eq!(Error::UnsupportedBackend("x".into()).exit_code(), 64);
        assert_eq!(
            Error::ProxmoxApiError {
                status: 500,
                body_excerpt: String::new()
            }
            .exit_code(),
            70
        );
    }

    #[test]
    fn scrub_secrets_redacts_token() {
        let msg = "calling proxmox with PVEAPIToken=root@pam!x=abcd1234 please";
        let scrubbed = scrub_secrets(msg);
        assert!(!scrubbed.contains("abcd1234"));
        assert!(scrubbed.contains("<redacted>"));
        assert!(scrubbed.ends_with("please"));
    }

    #[test]
    fn scrub_secrets_is_noop_without_token() {
        assert_eq!(scrub_secrets("no secrets here"), "no secrets here");
    }
}
