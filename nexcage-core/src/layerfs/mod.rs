//! The content-addressed layer store: ordered layers with dependencies,
//! integrity validation, overlay mounting, optional ZFS-backed storage,
//! garbage collection, and a metadata cache.

mod cache;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use cache::{CacheEntry, MetadataCache};

use crate::error::{Error, Result};

/// Compression applied to a layer's storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CompressionType {
    /// gzip.
    Gzip,
    /// zstd.
    Zstd,
    /// Uncompressed tar.
    None,
}

/// An immutable, content-addressed slice of a filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// Canonical `sha256:<64 hex>` digest, lower-case.
    pub digest: String,
    /// Media type, e.g. `application/vnd.oci.image.layer.v1.tar+zstd`.
    pub media_type: String,
    /// Uncompressed size in bytes; must be > 0.
    pub size: u64,
    /// ISO-8601 creation timestamp.
    pub created: Option<String>,
    /// Author string, if recorded by the source image.
    pub author: Option<String>,
    /// Free-form comment.
    pub comment: Option<String>,
    /// Parent-layer digests this layer depends on, oldest first.
    pub dependencies: Vec<String>,
    /// Ordering hint used to break topological-sort ties.
    pub order: u32,
    /// Absolute path to this layer's storage file.
    pub storage_path: Option<PathBuf>,
    /// Whether `storage_path` is compressed.
    pub compressed: bool,
    /// Compression codec, if `compressed`.
    pub compression: Option<CompressionType>,
    /// Whether `validate_layer` has succeeded for this layer since it was
    /// last modified.
    pub validated: bool,
    /// ISO-8601 timestamp of the last successful validation.
    pub last_validated: Option<String>,
}

impl Layer {
    /// Validates the structural invariants: well-formed digest, non-empty
    /// annotations (none modeled here beyond dependencies), and no
    /// self-reference among dependencies.
    fn check_invariants(&self) -> Result<()> {
        if !is_well_formed_digest(&self.digest) {
            return Err(Error::InternalError(format!(
                "layer digest {:?} is not well-formed",
                self.digest
            )));
        }
        if self.dependencies.iter().any(|d| d == &self.digest) {
            return Err(Error::InternalError(format!(
                "layer {} lists itself as a dependency",
                self.digest
            )));
        }
        Ok(())
    }
}

/// Whether `digest` matches `sha256:` followed by 64 lower-case hex digits.
#[must_use]
pub fn is_well_formed_digest(digest: &str) -> bool {
    let Some(hex) = digest.strip_prefix("sha256:") else {
        return false;
    };
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// An active overlay-filesystem stacking.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    /// Lower-layer storage paths, oldest to newest.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper directory, absent for a read-only stack.
    pub upper_dir: Option<PathBuf>,
    /// Overlay work directory.
    pub work_dir: PathBuf,
    /// Mount target.
    pub target: PathBuf,
}

/// Optional ZFS-backed storage strategy.
#[derive(Debug, Clone)]
pub struct ZfsConfig {
    /// ZFS pool name.
    pub pool: String,
    /// Dataset name under the pool.
    pub dataset: String,
}

/// Report produced by `validate_all`.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Digests that failed validation, paired with the error.
    pub failures: Vec<(String, Error)>,
    /// Count of layers validated successfully.
    pub succeeded: usize,
}

/// Report produced by `garbage_collect`.
#[derive(Debug, Default)]
pub struct GcReport {
    /// Digests removed (or, in `dry_run`, that would be removed).
    pub layers_removed: Vec<String>,
    /// Total bytes freed (or that would be freed).
    pub space_freed: u64,
    /// Non-fatal errors encountered while removing individual layers.
    pub errors: Vec<String>,
}

/// One operation accepted by `batch`.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// `add_layer`.
    Add(Layer),
    /// `remove_layer`.
    Remove(String),
    /// `mount_overlay`.
    Mount(String, PathBuf),
    /// `unmount_overlay`.
    Unmount(String),
}

/// Result of a `batch` call; batches have no all-or-nothing semantics —
/// callers observe each operation's outcome individually.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Number of operations that succeeded.
    pub successful: usize,
    /// Number of operations that failed.
    pub failed: usize,
    /// Errors, in the same order as the failed operations occurred.
    pub errors: Vec<String>,
}

/// Aggregate statistics over the whole store.
#[derive(Debug)]
pub struct DetailedStats {
    /// Total layer count.
    pub total_layers: usize,
    /// Layers currently mounted (have an overlay or mount point).
    pub mounted_layers: usize,
    /// Layers referenced as a dependency of some other layer.
    pub referenced_layers: usize,
    /// Layers that are neither mounted nor referenced.
    pub unused_layers: usize,
    /// Sum of `size` across all layers.
    pub total_size: u64,
    /// Sum of `size` across mounted layers.
    pub mounted_size: u64,
    /// Sum of `size` across referenced layers.
    pub referenced_size: u64,
    /// Sum of `size` across unused layers.
    pub unused_size: u64,
    /// Per-layer mounted/referenced breakdown.
    pub per_layer: Vec<LayerStats>,
}

/// Per-layer entry in [`DetailedStats`].
#[derive(Debug)]
pub struct LayerStats {
    /// Layer digest.
    pub digest: String,
    /// Layer size in bytes.
    pub size: u64,
    /// Whether the layer is currently mounted.
    pub mounted: bool,
    /// Whether the layer is referenced by another layer's dependencies.
    pub referenced: bool,
}

/// Owns the on-disk layer store.
///
/// Reads (`get_layer`, `list_layers`, cache lookups) are lock-free against
/// writers: the top-level map is copy-on-write, so a reader clones a
/// stable `Arc` snapshot under a brief lock and then never blocks.
/// Garbage collection takes the store's exclusive lock for its whole
/// scan-and-sweep; ordinary mutations take the shared lock, so they never
/// block each other but always yield to a running GC.
pub struct LayerFS {
    base_dir: PathBuf,
    layers: RwLock<std::sync::Arc<HashMap<String, Layer>>>,
    mount_points: RwLock<std::sync::Arc<HashMap<String, PathBuf>>>,
    overlays: RwLock<std::sync::Arc<HashMap<String, OverlayMount>>>,
    gc_exclusive: RwLock<()>,
    readonly: std::sync::atomic::AtomicBool,
    zfs: Option<ZfsConfig>,
    cache: Mutex<MetadataCache>,
}

impl std::fmt::Debug for LayerFS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerFS")
            .field("base_dir", &self.base_dir)
            .field("readonly", &self.is_readonly())
            .field("zfs", &self.zfs)
            .finish_non_exhaustive()
    }
}

impl LayerFS {
    /// Opens a layer store rooted at `base_dir`, with a metadata cache of
    /// `cache_capacity` entries.
    pub fn open(base_dir: impl Into<PathBuf>, cache_capacity: usize) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| Error::io(&base_dir, e))?;
        Ok(Self {
            base_dir,
            layers: RwLock::new(std::sync::Arc::new(HashMap::new())),
            mount_points: RwLock::new(std::sync::Arc::new(HashMap::new())),
            overlays: RwLock::new(std::sync::Arc::new(HashMap::new())),
            gc_exclusive: RwLock::new(()),
            readonly: std::sync::atomic::AtomicBool::new(false),
            zfs: None,
            cache: Mutex::new(MetadataCache::new(cache_capacity)),
        })
    }

    /// Opens a layer store backed by ZFS datasets under `pool/dataset`.
    pub fn open_zfs(
        base_dir: impl Into<PathBuf>,
        cache_capacity: usize,
        pool: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Result<Self> {
        let mut store = Self::open(base_dir, cache_capacity)?;
        store.zfs = Some(ZfsConfig {
            pool: pool.into(),
            dataset: dataset.into(),
        });
        Ok(store)
    }

    /// The store's base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Whether the store is in read-only mode.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Toggles read-only mode; mutating operations fail with
    /// [`Error::ReadOnly`] while set.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, std::sync::atomic::Ordering::Release);
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Storage path for `digest` under this store's layout (ZFS dataset
    /// path or a plain file under `<base>/layers/`).
    #[must_use]
    pub fn default_storage_path(&self, digest: &str) -> PathBuf {
        let short = digest.strip_prefix("sha256:").unwrap_or(digest);
        if let Some(zfs) = &self.zfs {
            PathBuf::from(format!("/{}/{}/{}", zfs.pool, zfs.dataset, &short[..short.len().min(12)]))
        } else {
            self.base_dir.join("layers").join(format!("{digest}.tar.zst").replace("sha256:", ""))
        }
    }

    // ---- Store operations ----------------------------------------------

    /// Inserts `layer`. Fails with [`Error::AlreadyExists`] if the digest
    /// is already present.
    pub fn add_layer(&self, layer: Layer) -> Result<()> {
        self.check_writable()?;
        layer.check_invariants()?;
        let _guard = self.gc_exclusive.read().map_err(poison_err)?;

        let mut write = self.layers.write().map_err(poison_err)?;
        if write.contains_key(&layer.digest) {
            return Err(Error::AlreadyExists(format!("layer {}", layer.digest)));
        }
        let mut next = (**write).clone();
        let digest = layer.digest.clone();
        next.insert(digest.clone(), layer);
        *write = std::sync::Arc::new(next);
        debug!(digest, "added layer");
        Ok(())
    }

    /// Removes `digest`. Idempotent: absent digests are not an error.
    /// Fails with [`Error::LayerInUse`] if the layer is mounted or is a
    /// dependency of another layer.
    pub fn remove_layer(&self, digest: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.gc_exclusive.read().map_err(poison_err)?;

        if self.mount_points.read().map_err(poison_err)?.contains_key(digest)
            || self.overlays.read().map_err(poison_err)?.contains_key(digest)
        {
            return Err(Error::LayerInUse(digest.to_string()));
        }

        let mut write = self.layers.write().map_err(poison_err)?;
        if !write.contains_key(digest) {
            return Ok(());
        }
        let referenced = write
            .values()
            .any(|l| l.digest != digest && l.dependencies.iter().any(|d| d == digest));
        if referenced {
            return Err(Error::LayerInUse(digest.to_string()));
        }
        let mut next = (**write).clone();
        next.remove(digest);
        *write = std::sync::Arc::new(next);
        self.cache.lock().map_err(poison_err)?.invalidate(digest);
        debug!(digest, "removed layer");
        Ok(())
    }

    /// Returns a snapshot copy of `digest`'s layer, if present. Lock-free
    /// beyond cloning the `Arc` snapshot.
    pub fn get_layer(&self, digest: &str) -> Result<Option<Layer>> {
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        Ok(snapshot.get(digest).cloned())
    }

    /// Returns a snapshot of every layer in the store.
    pub fn list_layers(&self) -> Result<Vec<Layer>> {
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        Ok(snapshot.values().cloned().collect())
    }

    // ---- Integrity -------------------------------------------------------

    /// Computes the SHA-256 of `digest`'s storage file and compares it to
    /// the declared digest, marking `validated`/`last_validated` on
    /// success.
    pub fn validate_layer(&self, digest: &str) -> Result<()> {
        let layer = self
            .get_layer(digest)?
            .ok_or_else(|| Error::NotFound(format!("layer {digest}")))?;
        let path = layer
            .storage_path
            .clone()
            .ok_or_else(|| Error::InternalError(format!("layer {digest} has no storage path")))?;
        let actual = nexcage_oci::compute_digest(&path)?;
        if actual != layer.digest {
            return Err(Error::DigestMismatch {
                digest: layer.digest.clone(),
                actual,
            });
        }

        let mut write = self.layers.write().map_err(poison_err)?;
        let mut next = (**write).clone();
        if let Some(entry) = next.get_mut(digest) {
            entry.validated = true;
            entry.last_validated = Some(now_timestamp());
        }
        *write = std::sync::Arc::new(next);
        Ok(())
    }

    /// Runs `validate_layer` over every layer, collecting failures instead
    /// of stopping at the first.
    pub fn validate_all(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for layer in self.list_layers()? {
            match self.validate_layer(&layer.digest) {
                Ok(()) => report.succeeded += 1,
                Err(e) => report.failures.push((layer.digest, e)),
            }
        }
        Ok(report)
    }

    // ---- Dependencies & ordering ------------------------------------------

    /// Topological walk detecting cycles in the dependency DAG.
    pub fn check_circular_dependencies(&self) -> Result<()> {
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        let mut visited: HashMap<&str, VisitState> = HashMap::new();
        let mut stack = Vec::new();

        for digest in snapshot.keys() {
            if !visited.contains_key(digest.as_str()) {
                visit(digest, &snapshot, &mut visited, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Returns layers in deterministic topological order: dependencies
    /// before dependents, ties broken by `order` ascending then digest
    /// lexical order.
    pub fn layers_in_order(&self) -> Result<Vec<Layer>> {
        self.check_circular_dependencies()?;
        let snapshot = self.layers.read().map_err(poison_err)?.clone();

        let mut digests: Vec<&String> = snapshot.keys().collect();
        digests.sort_by(|a, b| {
            let la = &snapshot[*a];
            let lb = &snapshot[*b];
            la.order.cmp(&lb.order).then_with(|| a.cmp(b))
        });

        let mut result = Vec::with_capacity(snapshot.len());
        let mut placed: HashSet<String> = HashSet::new();

        fn place(
            digest: &str,
            snapshot: &HashMap<String, Layer>,
            placed: &mut HashSet<String>,
            result: &mut Vec<Layer>,
        ) {
            if placed.contains(digest) {
                return;
            }
            let Some(layer) = snapshot.get(digest) else {
                return;
            };
            let mut deps = layer.dependencies.clone();
            deps.sort();
            for dep in &deps {
                place(dep, snapshot, placed, result);
            }
            placed.insert(digest.to_string());
            result.push(layer.clone());
        }

        for digest in digests {
            place(digest, &snapshot, &mut placed, &mut result);
        }
        Ok(result)
    }

    // ---- Mount points & overlays -----------------------------------------

    /// Records a logical mount-point binding for `digest`.
    pub fn create_mount_point(&self, digest: &str, path: impl Into<PathBuf>) -> Result<()> {
        self.check_writable()?;
        if self.get_layer(digest)?.is_none() {
            return Err(Error::NotFound(format!("layer {digest}")));
        }
        let mut write = self.mount_points.write().map_err(poison_err)?;
        if write.contains_key(digest) {
            return Err(Error::AlreadyExists(format!("mount point for {digest}")));
        }
        let mut next = (**write).clone();
        next.insert(digest.to_string(), path.into());
        *write = std::sync::Arc::new(next);
        Ok(())
    }

    /// Materializes an overlay filesystem rooted at `target`: lower dirs
    /// are the topologically sorted chain ending at `digest`, extracted on
    /// demand into their mount points; upper/work dirs live under
    /// `<base>/upper|work/<digest>`.
    pub fn mount_overlay(&self, digest: &str, target: impl Into<PathBuf>) -> Result<()> {
        self.check_writable()?;
        let target = target.into();

        {
            let overlays = self.overlays.read().map_err(poison_err)?;
            if overlays.contains_key(digest) {
                return Err(Error::InvalidOverlay(
                    digest.to_string(),
                    "already mounted".to_string(),
                ));
            }
        }

        let chain = self.dependency_chain(digest)?;
        let mut lower_dirs = Vec::with_capacity(chain.len());
        for layer_digest in &chain {
            let layer = self
                .get_layer(layer_digest)?
                .ok_or_else(|| Error::NotFound(format!("layer {layer_digest}")))?;
            let storage = layer
                .storage_path
                .unwrap_or_else(|| self.default_storage_path(layer_digest));
            self.ensure_extracted(layer_digest, &storage)?;
            lower_dirs.push(self.mount_point_for(layer_digest));
        }

        let upper_dir = self.base_dir.join("upper").join(sanitize(digest));
        let work_dir = self.base_dir.join("work").join(sanitize(digest));
        std::fs::create_dir_all(&upper_dir).map_err(|e| Error::io(&upper_dir, e))?;
        std::fs::create_dir_all(&work_dir).map_err(|e| Error::io(&work_dir, e))?;
        std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;

        if let Some(zfs) = &self.zfs {
            zfs_set_mountpoint(zfs, digest, &target)?;
        } else {
            mount_overlay_native(&lower_dirs, &upper_dir, &work_dir, &target)?;
        }

        let mount = OverlayMount {
            lower_dirs,
            upper_dir: Some(upper_dir),
            work_dir,
            target,
        };
        let mut write = self.overlays.write().map_err(poison_err)?;
        let mut next = (**write).clone();
        next.insert(digest.to_string(), mount);
        *write = std::sync::Arc::new(next);
        info!(digest, "mounted overlay");
        Ok(())
    }

    /// Unmounts `digest`'s overlay. Idempotent.
    pub fn unmount_overlay(&self, digest: &str) -> Result<()> {
        let mut write = self.overlays.write().map_err(poison_err)?;
        let Some(mount) = write.get(digest).cloned() else {
            return Ok(());
        };
        if let Some(zfs) = &self.zfs {
            zfs_unmount(zfs, digest)?;
        } else {
            unmount_overlay_native(&mount.target)?;
        }
        let mut next = (**write).clone();
        next.remove(digest);
        *write = std::sync::Arc::new(next);
        Ok(())
    }

    /// Mounts a caller-supplied ordered sequence of digests as a single
    /// overlay at `target`, without consulting the dependency graph.
    pub fn stack_layers(&self, digests: &[String], target: impl Into<PathBuf>) -> Result<()> {
        self.check_writable()?;
        let target = target.into();
        let mut lower_dirs = Vec::with_capacity(digests.len());
        for digest in digests {
            let layer = self
                .get_layer(digest)?
                .ok_or_else(|| Error::NotFound(format!("layer {digest}")))?;
            let storage = layer
                .storage_path
                .unwrap_or_else(|| self.default_storage_path(digest));
            self.ensure_extracted(digest, &storage)?;
            lower_dirs.push(self.mount_point_for(digest));
        }
        let key = digests.join(",");
        let upper_dir = self.base_dir.join("upper").join(sanitize(&key));
        let work_dir = self.base_dir.join("work").join(sanitize(&key));
        std::fs::create_dir_all(&upper_dir).map_err(|e| Error::io(&upper_dir, e))?;
        std::fs::create_dir_all(&work_dir).map_err(|e| Error::io(&work_dir, e))?;
        mount_overlay_native(&lower_dirs, &upper_dir, &work_dir, &target)?;
        Ok(())
    }

    /// Creates a synthetic layer whose storage is the flattened content of
    /// `digests`. If every input already points to the same content, this
    /// is a no-op that returns the shared digest.
    pub fn merge_layers(&self, digests: &[String], target_digest: &str) -> Result<()> {
        self.check_writable()?;
        if digests.iter().all(|d| d == target_digest) {
            return Ok(());
        }
        let scratch = self.base_dir.join("merge-scratch").join(sanitize(target_digest));
        let _ = std::fs::remove_dir_all(&scratch);
        std::fs::create_dir_all(&scratch).map_err(|e| Error::io(&scratch, e))?;

        for digest in digests {
            let layer = self
                .get_layer(digest)?
                .ok_or_else(|| Error::NotFound(format!("layer {digest}")))?;
            let storage = layer
                .storage_path
                .unwrap_or_else(|| self.default_storage_path(digest));
            nexcage_oci::extract_archive(&storage, &scratch)?;
        }

        let dest = self.default_storage_path(target_digest);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        nexcage_oci::pack_archive(&scratch, &dest, nexcage_oci::Codec::Zstd)?;
        let size = std::fs::metadata(&dest).map_err(|e| Error::io(&dest, e))?.len();
        let _ = std::fs::remove_dir_all(&scratch);

        self.add_layer(Layer {
            digest: target_digest.to_string(),
            media_type: "application/vnd.nexcage.layer.merged.v1.tar+zstd".to_string(),
            size,
            created: Some(now_timestamp()),
            author: None,
            comment: Some(format!("merged from {} layers", digests.len())),
            dependencies: Vec::new(),
            order: 0,
            storage_path: Some(dest),
            compressed: true,
            compression: Some(CompressionType::Zstd),
            validated: false,
            last_validated: None,
        })
    }

    /// The digest's full dependency chain in topological order, ending
    /// with `digest` itself.
    fn dependency_chain(&self, digest: &str) -> Result<Vec<String>> {
        self.check_circular_dependencies()?;
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        let mut result = Vec::new();
        let mut placed = HashSet::new();

        fn visit_chain(
            digest: &str,
            snapshot: &HashMap<String, Layer>,
            placed: &mut HashSet<String>,
            result: &mut Vec<String>,
        ) -> Result<()> {
            if placed.contains(digest) {
                return Ok(());
            }
            let layer = snapshot
                .get(digest)
                .ok_or_else(|| Error::NotFound(format!("layer {digest}")))?;
            let mut deps = layer.dependencies.clone();
            deps.sort();
            for dep in &deps {
                visit_chain(dep, snapshot, placed, result)?;
            }
            placed.insert(digest.to_string());
            result.push(digest.to_string());
            Ok(())
        }

        visit_chain(digest, &snapshot, &mut placed, &mut result)?;
        Ok(result)
    }

    fn mount_point_for(&self, digest: &str) -> PathBuf {
        self.base_dir.join("mnt").join(sanitize(digest))
    }

    /// Extracts `storage` into `digest`'s mount point if not already done.
    fn ensure_extracted(&self, digest: &str, storage: &Path) -> Result<()> {
        let mount_point = self.mount_point_for(digest);
        if mount_point.is_dir()
            && std::fs::read_dir(&mount_point)
                .map(|mut it| it.next().is_some())
                .unwrap_or(false)
        {
            return Ok(());
        }
        nexcage_oci::extract_archive(storage, &mount_point)?;
        Ok(())
    }

    // ---- Garbage collection ------------------------------------------------

    /// Removes layers that are neither mounted nor in the reverse-dependency
    /// closure of any mounted layer. Safe under concurrent reads: it holds
    /// the store's exclusive lock for the whole scan-and-sweep.
    pub fn garbage_collect(&self, dry_run: bool) -> Result<GcReport> {
        let _guard = self.gc_exclusive.write().map_err(poison_err)?;
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        let mounted: HashSet<String> = self
            .overlays
            .read()
            .map_err(poison_err)?
            .keys()
            .cloned()
            .chain(self.mount_points.read().map_err(poison_err)?.keys().cloned())
            .collect();

        let mut reachable = mounted.clone();
        let mut frontier: Vec<String> = mounted.iter().cloned().collect();
        while let Some(digest) = frontier.pop() {
            if let Some(layer) = snapshot.get(&digest) {
                for dep in &layer.dependencies {
                    if reachable.insert(dep.clone()) {
                        frontier.push(dep.clone());
                    }
                }
            }
        }

        let mut report = GcReport::default();
        for (digest, layer) in snapshot.iter() {
            if reachable.contains(digest) {
                continue;
            }
            report.layers_removed.push(digest.clone());
            report.space_freed += layer.size;
            if !dry_run {
                if let Some(path) = &layer.storage_path {
                    if let Err(e) = std::fs::remove_file(path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            report.errors.push(format!("{digest}: {e}"));
                        }
                    }
                }
            }
        }

        if !dry_run {
            let mut write = self.layers.write().map_err(poison_err)?;
            let mut next = (**write).clone();
            for digest in &report.layers_removed {
                next.remove(digest);
            }
            *write = std::sync::Arc::new(next);
            let mut cache = self.cache.lock().map_err(poison_err)?;
            for digest in &report.layers_removed {
                cache.invalidate(digest);
            }
        }

        info!(
            removed = report.layers_removed.len(),
            freed = report.space_freed,
            dry_run,
            "garbage collection complete"
        );
        Ok(report)
    }

    // ---- Metadata cache ----------------------------------------------------

    /// Looks up `digest` in the metadata cache, falling back to the main
    /// store (and populating the cache) on a miss.
    pub fn cached_metadata(&self, digest: &str) -> Result<Option<CacheEntry>> {
        if let Some(hit) = self.cache.lock().map_err(poison_err)?.get(digest) {
            return Ok(Some(hit));
        }
        let Some(layer) = self.get_layer(digest)? else {
            return Ok(None);
        };
        self.cache
            .lock()
            .map_err(poison_err)?
            .put(digest.to_string(), layer.media_type.clone(), layer.size, layer.validated);
        Ok(Some(CacheEntry {
            media_type: layer.media_type,
            size: layer.size,
            validated: layer.validated,
            last_access: 0,
            access_count: 1,
        }))
    }

    // ---- Batch operations ---------------------------------------------------

    /// Applies `ops` in order, recording each op's individual outcome.
    /// There is no all-or-nothing semantics: callers observe per-op
    /// results.
    pub fn batch(&self, ops: Vec<BatchOp>) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        for op in ops {
            let outcome = match op {
                BatchOp::Add(layer) => self.add_layer(layer),
                BatchOp::Remove(digest) => self.remove_layer(&digest),
                BatchOp::Mount(digest, target) => self.mount_overlay(&digest, target),
                BatchOp::Unmount(digest) => self.unmount_overlay(&digest),
            };
            match outcome {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(e.to_string());
                }
            }
        }
        Ok(result)
    }

    // ---- Stats ---------------------------------------------------------------

    /// Returns totals, sizes, and a per-layer mounted/referenced breakdown.
    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        let snapshot = self.layers.read().map_err(poison_err)?.clone();
        let mounted: HashSet<String> = self
            .overlays
            .read()
            .map_err(poison_err)?
            .keys()
            .cloned()
            .chain(self.mount_points.read().map_err(poison_err)?.keys().cloned())
            .collect();
        let referenced: HashSet<&str> = snapshot
            .values()
            .flat_map(|l| l.dependencies.iter().map(String::as_str))
            .collect();

        let mut stats = DetailedStats {
            total_layers: snapshot.len(),
            mounted_layers: 0,
            referenced_layers: 0,
            unused_layers: 0,
            total_size: 0,
            mounted_size: 0,
            referenced_size: 0,
            unused_size: 0,
            per_layer: Vec::with_capacity(snapshot.len()),
        };

        for layer in snapshot.values() {
            let is_mounted = mounted.contains(&layer.digest);
            let is_referenced = referenced.contains(layer.digest.as_str());
            stats.total_size += layer.size;
            if is_mounted {
                stats.mounted_layers += 1;
                stats.mounted_size += layer.size;
            }
            if is_referenced {
                stats.referenced_layers += 1;
                stats.referenced_size += layer.size;
            }
            if !is_mounted && !is_referenced {
                stats.unused_layers += 1;
                stats.unused_size += layer.size;
            }
            stats.per_layer.push(LayerStats {
                digest: layer.digest.clone(),
                size: layer.size,
                mounted: is_mounted,
                referenced: is_referenced,
            });
        }
        Ok(stats)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

fn visit<'a>(
    digest: &'a str,
    snapshot: &'a HashMap<String, Layer>,
    visited: &mut HashMap<&'a str, VisitState>,
    stack: &mut Vec<String>,
) -> Result<()> {
    visited.insert(digest, VisitState::Visiting);
    stack.push(digest.to_string());
    if let Some(layer) = snapshot.get(digest) {
        for dep in &layer.dependencies {
            match visited.get(dep.as_str()) {
                Some(VisitState::Visiting) => {
                    return Err(Error::CircularDependency(stack.clone()));
                }
                Some(VisitState::Done) => {}
                None => visit(dep, snapshot, visited, stack)?,
            }
        }
    }
    stack.pop();
    visited.insert(digest, VisitState::Done);
    Ok(())
}

fn poison_err<T>(_: T) -> Error {
    Error::InternalError("layer store lock poisoned".to_string())
}

fn sanitize(digest: &str) -> String {
    digest.replace([':', '/'], "_")
}

fn now_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    // Minimal ISO-8601 rendering (UTC, second precision) without pulling
    // in a datetime crate the rest of the stack doesn't already use.
    format!("{secs}")
}

#[cfg(unix)]
fn mount_overlay_native(
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    work_dir: &Path,
    target: &Path,
) -> Result<()> {
    let lower = lower_dirs
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let options = format!(
        "lowerdir={lower},upperdir={},workdir={}",
        upper_dir.display(),
        work_dir.display()
    );
    let status = std::process::Command::new("mount")
        .args(["-t", "overlay", "overlay", "-o", &options])
        .arg(target)
        .status()
        .map_err(|e| Error::io(target, e))?;
    if !status.success() {
        return Err(Error::InvalidOverlay(
            target.display().to_string(),
            format!("mount exited with {status}"),
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn unmount_overlay_native(target: &Path) -> Result<()> {
    let status = std::process::Command::new("umount")
        .arg(target)
        .status()
        .map_err(|e| Error::io(target, e))?;
    if !status.success() {
        return Err(Error::InvalidOverlay(
            target.display().to_string(),
            format!("umount exited with {status}"),
        ));
    }
    Ok(())
}

fn zfs_set_mountpoint(zfs: &ZfsConfig, digest: &str, target: &Path) -> Result<()> {
    let short = digest.strip_prefix("sha256:").unwrap_or(digest);
    let dataset = format!("{}/{}/{}", zfs.pool, zfs.dataset, &short[..short.len().min(12)]);
    let status = std::process::Command::new("zfs")
        .args(["set", &format!("mountpoint={}", target.display()), &dataset])
        .status()
        .map_err(|e| Error::io(target, e))?;
    if !status.success() {
        return Err(Error::InvalidOverlay(digest.to_string(), "zfs set mountpoint failed".to_string()));
    }
    Ok(())
}

fn zfs_unmount(zfs: &ZfsConfig, digest: &str) -> Result<()> {
    let short = digest.strip_prefix("sha256:").unwrap_or(digest);
    let dataset = format!("{}/{}/{}", zfs.pool, zfs.dataset, &short[..short.len().min(12)]);
    let status = std::process::Command::new("zfs")
        .args(["unmount", &dataset])
        .status()
        .map_err(|e| Error::io(Path::new(&dataset), e))?;
    if !status.success() {
        return Err(Error::InvalidOverlay(digest.to_string(), "zfs unmount failed".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_layer(digest: &str, deps: &[&str], order: u32) -> Layer {
        Layer {
            digest: digest.to_string(),
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            size: 1024,
            created: None,
            author: None,
            comment: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            order,
            storage_path: None,
            compressed: false,
            compression: None,
            validated: false,
            last_validated: None,
        }
    }

    fn digest(n: u8) -> String {
        format!("sha256:{:064x}", n)
    }

    #[test]
    fn add_then_get_then_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let d = digest(1);
        store.add_layer(make_layer(&d, &[], 0)).expect("add");
        assert!(store.get_layer(&d).expect("get").is_some());
        store.remove_layer(&d).expect("remove");
        assert!(store.get_layer(&d).expect("get").is_none());
    }

    #[test]
    fn duplicate_digest_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let d = digest(1);
        store.add_layer(make_layer(&d, &[], 0)).expect("add");
        assert!(store.add_layer(make_layer(&d, &[], 0)).is_err());
    }

    #[test]
    fn remove_missing_digest_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        assert!(store.remove_layer(&digest(9)).is_ok());
    }

    #[test]
    fn remove_referenced_layer_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let base = digest(1);
        let child = digest(2);
        store.add_layer(make_layer(&base, &[], 0)).expect("add base");
        store.add_layer(make_layer(&child, &[&base], 1)).expect("add child");
        assert!(matches!(store.remove_layer(&base), Err(Error::LayerInUse(_))));
    }

    #[test]
    fn readonly_rejects_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        store.set_readonly(true);
        assert!(matches!(store.add_layer(make_layer(&digest(1), &[], 0)), Err(Error::ReadOnly)));
    }

    #[test]
    fn detects_circular_dependency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let a = digest(1);
        let b = digest(2);
        store.add_layer(make_layer(&a, &[&b.clone()], 0)).expect("add a");
        store.add_layer(make_layer(&b, &[&a.clone()], 1)).expect("add b");
        assert!(matches!(
            store.check_circular_dependencies(),
            Err(Error::CircularDependency(_))
        ));
    }

    #[test]
    fn layers_in_order_respects_dependencies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let base = digest(1);
        let mid = digest(2);
        let top = digest(3);
        store.add_layer(make_layer(&top, &[&mid.clone()], 2)).expect("add top");
        store.add_layer(make_layer(&mid, &[&base.clone()], 1)).expect("add mid");
        store.add_layer(make_layer(&base, &[], 0)).expect("add base");

        let ordered = store.layers_in_order().expect("order");
        assert_eq!(ordered.len(), 3);
        let pos = |d: &str| ordered.iter().position(|l| l.digest == d).expect("present");
        assert!(pos(&base) < pos(&mid));
        assert!(pos(&mid) < pos(&top));
    }

    #[test]
    fn layers_in_order_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        for n in [3u8, 1, 2] {
            store.add_layer(make_layer(&digest(n), &[], 0)).expect("add");
        }
        let first = store.layers_in_order().expect("order 1");
        let second = store.layers_in_order().expect("order 2");
        let first_digests: Vec<_> = first.iter().map(|l| l.digest.clone()).collect();
        let second_digests: Vec<_> = second.iter().map(|l| l.digest.clone()).collect();
        assert_eq!(first_digests, second_digests);
    }

    #[test]
    fn gc_dry_run_matches_real_run_when_state_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        store.add_layer(make_layer(&digest(1), &[], 0)).expect("add");
        let dry = store.garbage_collect(true).expect("dry run");
        let real = store.garbage_collect(false).expect("real run");
        assert_eq!(dry.layers_removed.len(), real.layers_removed.len());
        assert!(store.get_layer(&digest(1)).expect("get").is_none());
    }

    #[test]
    fn batch_reports_partial_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let d = digest(1);
        store.add_layer(make_layer(&d, &[], 0)).expect("add");
        let result = store
            .batch(vec![
                BatchOp::Add(make_layer(&d, &[], 0)), // fails: duplicate
                BatchOp::Remove(d.clone()),
            ])
            .expect("batch");
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn detailed_stats_classifies_layers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LayerFS::open(dir.path(), 16).expect("open");
        let base = digest(1);
        let orphan = digest(2);
        store.add_layer(make_layer(&base, &[], 0)).expect("add base");
        store.add_layer(make_layer(&orphan, &[], 0)).expect("add orphan");
        let stats = store.detailed_stats().expect("stats");
        assert_eq!(stats.total_layers, 2);
        assert_eq!(stats.unused_layers, 2);
    }
}
