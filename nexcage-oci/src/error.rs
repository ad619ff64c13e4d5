//! Error taxonomy for archive and bundle handling.

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while hashing, packing/unpacking archives, or parsing bundles.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An archive entry's resolved path escapes the extraction destination,
    /// or the archive structure is otherwise malformed.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// The archive suffix/magic bytes didn't match any supported codec.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    /// The bundle's `config.json` failed spec validation.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// A copy-with-digest verified against a declared digest and didn't match.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the caller expected.
        expected: String,
        /// The digest actually computed.
        actual: String,
    },

    /// I/O failure, tagged with the path being operated on when known.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being read, written, or walked when the error occurred.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A bare I/O error with no meaningful associated path.
    #[error(transparent)]
    PlainIo(#[from] std::io::Error),

    /// `config.json` failed to deserialize as JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an I/O error with the path that was being operated on.
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
