//! Multi-codec tar archive extraction and packing.
//!
//! Handles `.tar`, `.tar.gz`/`.tgz`, and `.tar.zst`/`.tzst`, with OCI
//! whiteout semantics (`.wh.<name>`, `.wh..wh..opq`) applied while
//! extracting layered rootfs content.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Compression codec applied to a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// No compression, raw tar.
    None,
    /// gzip, as produced by `docker save` and most registries.
    Gzip,
    /// zstd, the default codec for Proxmox templates.
    Zstd,
}

impl Codec {
    /// `pack_archive`'s default codec for freshly built templates.
    pub const DEFAULT_TEMPLATE_CODEC: Self = Self::Zstd;

    /// zstd compression level used for template packing.
    const ZSTD_LEVEL: i32 = 3;
}

/// Outcome of an `extract_archive` call.
#[derive(Debug, Default, Clone)]
pub struct ExtractReport {
    /// Number of regular entries unpacked.
    pub entries: usize,
    /// Device-node entries skipped because the process isn't running as root.
    pub skipped_device_nodes: usize,
}

/// Detects the codec of `src` by file suffix, falling back to magic bytes.
fn detect_codec(src: &Path) -> Result<Codec> {
    let name = src
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        return Ok(Codec::Zstd);
    }
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Ok(Codec::Gzip);
    }
    if name.ends_with(".tar") {
        return Ok(Codec::None);
    }

    // No recognized suffix: sniff magic bytes.
    let mut f = File::open(src).map_err(|e| Error::io(src, e))?;
    let mut magic = [0u8; 4];
    let n = f.read(&mut magic).map_err(|e| Error::io(src, e))?;
    if n >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(Codec::Gzip);
    }
    if n >= 4 && magic == [0x28, 0xb5, 0x2f, 0xfd] {
        return Ok(Codec::Zstd);
    }
    Err(Error::UnsupportedFormat(src.display().to_string()))
}

/// Extracts the archive at `src` into `dst`, auto-detecting its codec.
///
/// Refuses any entry whose normalized path would escape `dst` (an
/// absolute path, or one containing a `..` component). OCI whiteout
/// entries are honored so callers can extract a stack of layers in
/// order into a single rootfs.
pub fn extract_archive(src: &Path, dst: &Path) -> Result<ExtractReport> {
    fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let codec = detect_codec(src)?;
    let file = File::open(src).map_err(|e| Error::io(src, e))?;
    let reader: Box<dyn Read> = match codec {
        Codec::None => Box::new(file),
        Codec::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(file).map_err(|e| Error::io(src, e))?),
    };
    let report = extract_tar_stream(reader, dst)?;
    info!(entries = report.entries, skipped = report.skipped_device_nodes, path = %src.display(), "extracted archive");
    Ok(report)
}

/// Extracts a single already-decompressed tar stream, applying whiteouts.
fn extract_tar_stream(reader: impl Read, dst: &Path) -> Result<ExtractReport> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);

    let mut report = ExtractReport::default();
    let running_as_root = is_root();

    for raw_entry in archive.entries().map_err(|e| Error::io(dst, e))? {
        let mut entry = raw_entry.map_err(|e| Error::io(dst, e))?;
        let rel = entry.path().map_err(|e| Error::io(dst, e))?.into_owned();

        let target = safe_join(dst, &rel)?;

        let file_name = match rel.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_owned(),
            None => continue,
        };

        if file_name == ".wh..wh..opq" {
            if let Some(parent) = target.parent() {
                if parent.exists() {
                    clear_directory(parent)?;
                }
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(".wh.") {
            let victim = target
                .parent()
                .map(|p| p.join(target_name))
                .unwrap_or_else(|| dst.join(target_name));
            if victim.is_dir() {
                let _ = fs::remove_dir_all(&victim);
            } else {
                let _ = fs::remove_file(&victim);
            }
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Block | EntryType::Char if !running_as_root => {
                warn!(path = %rel.display(), "skipping device node, not running as root");
                report.skipped_device_nodes += 1;
                continue;
            }
            _ => {}
        }

        debug!(path = %rel.display(), "extracting entry");
        entry.unpack_in(dst).map_err(|e| Error::io(&target, e))?;
        report.entries += 1;
    }

    Ok(report)
}

/// Joins `dst` with an archive-relative path, refusing escapes.
fn safe_join(dst: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute() {
        return Err(Error::InvalidArchive(format!(
            "entry path {} is absolute",
            rel.display()
        )));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(Error::InvalidArchive(format!(
                    "entry path {} escapes destination",
                    rel.display()
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::InvalidArchive(format!(
                    "entry path {} is absolute",
                    rel.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(dst.join(rel))
}

/// Removes all contents of a directory without removing the directory itself.
fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_root() -> bool {
    // No libc dependency: read the effective uid straight out of
    // `/proc/self/status` rather than calling `geteuid()`.
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                let rest = line.strip_prefix("Uid:")?;
                rest.split_whitespace().nth(1)?.parse::<u32>().ok()
            })
        })
        .is_some_and(|euid| euid == 0)
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Packs `src_dir` into `dst` as a tar stream compressed with `codec`.
pub fn pack_archive(src_dir: &Path, dst: &Path, codec: Codec) -> Result<()> {
    let tmp = {
        let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".part");
        dst.with_file_name(name)
    };

    let result = (|| -> Result<()> {
        let file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        match codec {
            Codec::None => {
                let mut builder = Builder::new(file);
                builder.append_dir_all(".", src_dir).map_err(|e| Error::io(src_dir, e))?;
                builder.finish().map_err(|e| Error::io(&tmp, e))?;
            }
            Codec::Gzip => {
                let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
                let mut builder = Builder::new(enc);
                builder.append_dir_all(".", src_dir).map_err(|e| Error::io(src_dir, e))?;
                let enc = builder.into_inner().map_err(|e| Error::io(&tmp, e))?;
                enc.finish().map_err(|e| Error::io(&tmp, e))?;
            }
            Codec::Zstd => {
                let enc = zstd::stream::write::Encoder::new(file, Codec::ZSTD_LEVEL)
                    .map_err(|e| Error::io(&tmp, e))?;
                let mut builder = Builder::new(enc);
                builder.append_dir_all(".", src_dir).map_err(|e| Error::io(src_dir, e))?;
                let enc = builder.into_inner().map_err(|e| Error::io(&tmp, e))?;
                enc.finish().map_err(|e| Error::io(&tmp, e))?;
            }
        }
        fs::rename(&tmp, dst).map_err(|e| Error::io(dst, e))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let buf = Vec::new();
        let enc = flate2::write::GzEncoder::new(buf, flate2::Compression::default());
        let mut builder = Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).expect("append");
        }
        let enc = builder.into_inner().expect("into_inner");
        enc.finish().expect("finish")
    }

    #[test]
    fn extract_refuses_parent_dir_escape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("evil.tar.gz");
        std::fs::write(&src, make_tar_gz(&[("../escape.txt", b"x")])).expect("write");
        let dst = dir.path().join("dst");
        let err = extract_archive(&src, &dst).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn extract_refuses_absolute_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("evil.tar.gz");
        std::fs::write(&src, make_tar_gz(&[("/etc/passwd", b"x")])).expect("write");
        let dst = dir.path().join("dst");
        let err = extract_archive(&src, &dst).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn extract_applies_regular_whiteout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dst = dir.path().join("rootfs");
        std::fs::create_dir_all(&dst).expect("mkdir");
        std::fs::write(dst.join("keepme"), b"1").expect("write");

        let src = dir.path().join("layer.tar.gz");
        std::fs::write(&src, make_tar_gz(&[(".wh.keepme", b"")])).expect("write");
        extract_archive(&src, &dst).expect("extract");
        assert!(!dst.join("keepme").exists());
    }

    #[test]
    fn pack_then_extract_roundtrips_plain_tar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src_dir = dir.path().join("src");
        std::fs::create_dir_all(&src_dir).expect("mkdir");
        let mut f = File::create(src_dir.join("a.txt")).expect("create");
        f.write_all(b"hello").expect("write");
        drop(f);

        let archive_path = dir.path().join("out.tar");
        pack_archive(&src_dir, &archive_path, Codec::None).expect("pack");
        assert!(archive_path.exists());
        assert!(!dir.path().join("out.tar.part").exists());

        let dst = dir.path().join("dst");
        let report = extract_archive(&archive_path, &dst).expect("extract");
        assert_eq!(report.entries, 1);
        assert_eq!(std::fs::read(dst.join("a.txt")).expect("read"), b"hello");
    }
}
