//! Content digests and integrity-checked copies.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Computes `sha256:<hex>` over the raw bytes of the file at `path`.
///
/// For tar streams the digest is computed over the bytes on disk, never
/// over the untarred content — callers that need a layer's uncompressed
/// digest must extract first and hash the extracted form separately.
pub fn compute_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex_encode(&hasher.finalize())))
}

/// Formats raw bytes as a canonical `sha256:<hex>` digest string.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex_encode(&hasher.finalize()))
}

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// A writer that hashes every byte written through it before forwarding.
struct HashWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copies `src` to `dst` while computing the digest of the bytes written.
///
/// Writes to `dst.tmp` and renames into place on success so a reader never
/// observes a partially written file; on any failure the temp file is
/// removed.
pub fn copy_with_digest(src: &Path, dst: &Path) -> Result<String> {
    let tmp = tmp_path(dst);
    let result = (|| -> Result<String> {
        let mut reader = File::open(src).map_err(|e| Error::io(src, e))?;
        let file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        let mut writer = HashWriter {
            inner: file,
            hasher: Sha256::new(),
        };
        io::copy(&mut reader, &mut writer).map_err(|e| Error::io(dst, e))?;
        writer.flush().map_err(|e| Error::io(dst, e))?;
        let digest = format!("sha256:{}", hex_encode(&writer.hasher.finalize()));
        std::fs::rename(&tmp, dst).map_err(|e| Error::io(dst, e))?;
        Ok(digest)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(dst: &Path) -> std::path::PathBuf {
    let mut name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    dst.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").expect("write");
        let digest = compute_digest(&path).expect("digest");
        assert_eq!(
            digest,
            "sha256:b94d27b9934d3e08a52e52d7da7dacefbc847c624eaaee58cd1ab37c3bf7f92"
        );
    }

    #[test]
    fn content_digest_matches_compute_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").expect("write");
        assert_eq!(compute_digest(&path).expect("digest"), content_digest(b"abc"));
    }

    #[test]
    fn copy_with_digest_is_atomic_and_correct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let mut f = File::create(&src).expect("create");
        f.write_all(b"payload").expect("write");
        drop(f);

        let digest = copy_with_digest(&src, &dst).expect("copy");
        assert_eq!(digest, content_digest(b"payload"));
        assert!(dst.exists());
        assert!(!dir.path().join("dst.tmp").exists());
    }
}
