//! The catalog manager: a lazily-grown tree of catalogs with atomic
//! revision swaps.
//!
//! Lookups descend from the root catalog; when a path crosses into a
//! nested catalog that is not loaded yet, the child is fetched by its
//! recorded digest, attached with a fresh disjoint inode range, and the
//! descent continues. `remount` stages a new revision (dry run) and later
//! swaps the tree root atomically; the engine's remount fence guarantees
//! no filesystem call observes the swap mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use cvmfs_cache::{BlessedObject, CacheError, Fetcher};
use cvmfs_download::Downloader;
use cvmfs_types::{DirectoryEntry, FileChunkList, OwnerMap, RepoPath};

use crate::catalog::Catalog;
use crate::inode::{InodeGenerationAnnotation, InodeRange, INODE_OFFSET};
use crate::manifest::Manifest;
use crate::{CatalogError, Result};

/// How a lookup resolves the terminal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// The entry alone.
    Sole,
    /// The entry plus its parent entry.
    Full,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub dirent: DirectoryEntry,
    /// Parent entry, resolved in `Full` mode for non-root paths.
    pub parent: Option<DirectoryEntry>,
}

/// Outcome of a remount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    UpToDate,
    New,
    Fail,
    NoSpace,
}

/// The lazily-loaded catalog tree.
pub struct CatalogManager {
    fqrn: String,
    fetcher: Arc<Fetcher>,
    download: Arc<dyn Downloader>,
    root: RwLock<Option<Arc<Catalog>>>,
    annotation: Option<Arc<InodeGenerationAnnotation>>,
    uid_map: Arc<OwnerMap>,
    gid_map: Arc<OwnerMap>,
    /// Next free inode-range offset; never reset, so ranges of all
    /// catalogs ever loaded stay pairwise disjoint.
    inode_watermark: Mutex<u64>,
    /// Manifest staged by a dry-run remount, applied by the wet run.
    staged: Mutex<Option<Manifest>>,
    offline: AtomicBool,
}

impl CatalogManager {
    pub fn new(fqrn: impl Into<String>, fetcher: Arc<Fetcher>, download: Arc<dyn Downloader>) -> Self {
        Self {
            fqrn: fqrn.into(),
            fetcher,
            download,
            root: RwLock::new(None),
            annotation: None,
            uid_map: Arc::new(OwnerMap::default()),
            gid_map: Arc::new(OwnerMap::default()),
            inode_watermark: Mutex::new(INODE_OFFSET),
            staged: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    /// Install the inode annotation. Must happen before `init`.
    pub fn set_inode_annotation(&mut self, annotation: Arc<InodeGenerationAnnotation>) {
        self.annotation = Some(annotation);
    }

    /// Install the static owner remaps. Must happen before `init`.
    pub fn set_owner_maps(&mut self, uid_map: OwnerMap, gid_map: OwnerMap) {
        self.uid_map = Arc::new(uid_map);
        self.gid_map = Arc::new(gid_map);
    }

    /// Fetch the manifest and load the root catalog.
    pub fn init(&self) -> Result<()> {
        let manifest = Manifest::fetch(self.download.as_ref(), &self.fqrn)?;
        let root = self.load_catalog(&manifest.catalog_digest, RepoPath::root(), None)?;
        *self.root.write().unwrap() = Some(root);
        info!(revision = self.revision(), "mounted root catalog");
        Ok(())
    }

    /// Load a pinned root catalog, bypassing the manifest. Used with
    /// `CVMFS_ROOT_HASH` and repository tags; such mounts never remount.
    pub fn init_fixed(&self, root_hash: cvmfs_types::ContentDigest) -> Result<()> {
        let root = self.load_catalog(&root_hash, RepoPath::root(), None)?;
        *self.root.write().unwrap() = Some(root);
        info!(root_hash = %root_hash, "mounted fixed root catalog");
        Ok(())
    }

    fn root_catalog(&self) -> Result<Arc<Catalog>> {
        self.root
            .read()
            .unwrap()
            .clone()
            .ok_or(CatalogError::NotInitialized)
    }

    /// Fetch a catalog object and attach it below `parent`.
    fn load_catalog(
        &self,
        digest: &cvmfs_types::ContentDigest,
        mountpoint: RepoPath,
        parent: Option<&Arc<Catalog>>,
    ) -> Result<Arc<Catalog>> {
        let object = BlessedObject::pinned(
            *digest,
            format!("file catalog at {}:{}", self.fqrn, mountpoint),
        );
        let _file = self.fetcher.fetch_catalog(&object)?;
        let db_path = self
            .fetcher
            .cache()
            .object_path(&object)
            .ok_or_else(|| CatalogError::BadManifest("catalog not materialized in cache".into()))?;

        let catalog = Arc::new(Catalog::open(
            &db_path,
            mountpoint,
            *digest,
            parent,
            self.annotation.clone(),
            Arc::clone(&self.uid_map),
            Arc::clone(&self.gid_map),
        )?);

        let range = {
            let mut watermark = self.inode_watermark.lock().unwrap();
            let range = InodeRange::new(*watermark, catalog.max_row_id() + 1);
            *watermark += catalog.max_row_id() + 1;
            range
        };
        catalog.set_inode_range(range);

        if let Some(parent) = parent {
            parent.add_child(Arc::clone(&catalog));
        }
        Ok(catalog)
    }

    /// Walk down to the catalog serving `path`, loading nested catalogs
    /// as needed. In offline mode unloaded mountpoints are unreachable.
    fn mount_subtree(&self, path: &RepoPath) -> Result<Arc<Catalog>> {
        let root = self.root_catalog()?;
        let mut catalog = root.find_subtree(path);
        loop {
            let Some((mountpoint, digest)) = catalog.find_nested_for_path(path)? else {
                return Ok(catalog);
            };
            if mountpoint == *catalog.mountpoint() {
                return Ok(catalog);
            }
            if let Some(child) = catalog.find_child(&mountpoint) {
                catalog = child;
                continue;
            }
            if self.offline.load(Ordering::Relaxed) {
                debug!(mountpoint = %mountpoint,
                       "offline mode, refusing to load nested catalog");
                return Ok(catalog);
            }
            match self.load_catalog(&digest, mountpoint.clone(), Some(&catalog)) {
                Ok(child) => catalog = child,
                Err(e) => {
                    warn!(mountpoint = %mountpoint, error = %e,
                          "failed to load nested catalog");
                    self.offline.store(true, Ordering::Relaxed);
                    return Ok(catalog);
                }
            }
        }
    }

    /// Resolve `path` to a directory entry, descending into nested
    /// catalogs on demand. `Ok(None)` means the path does not exist (the
    /// caller inserts a negative cache entry).
    pub fn lookup_path(&self, path: &RepoPath, mode: LookupMode) -> Result<Option<LookupResult>> {
        let catalog = self.mount_subtree(path)?;
        let Some(dirent) = catalog.lookup_md5(&path.md5())? else {
            return Ok(None);
        };
        let parent = match (mode, path.is_root()) {
            (LookupMode::Full, false) => {
                let parent_path = path.parent();
                let parent_catalog = self.mount_subtree(&parent_path)?;
                parent_catalog.lookup_md5(&parent_path.md5())?
            }
            _ => None,
        };
        Ok(Some(LookupResult { dirent, parent }))
    }

    /// List the directory at `path` with materialized stat data.
    pub fn listing(&self, path: &RepoPath) -> Result<Vec<DirectoryEntry>> {
        // A mountpoint's content lives in the child catalog, so make sure
        // the chain down to `path` itself is loaded.
        let catalog = self.mount_subtree(path)?;
        let serving = match catalog.find_child(path) {
            Some(child) => child,
            None => catalog,
        };
        serving.listing(path)
    }

    /// The chunk list of the chunked regular file at `path`.
    pub fn list_file_chunks(&self, path: &RepoPath) -> Result<FileChunkList> {
        let catalog = self.mount_subtree(path)?;
        catalog.chunk_list(&path.md5())
    }

    /// Stage or apply a new revision.
    ///
    /// Dry run: fetch the manifest; report `UpToDate` if the root digest
    /// is unchanged, otherwise stage the new root catalog in the cache
    /// and report `New`. Wet run: swap the tree root to the staged
    /// revision, tear down the old tree and bump the inode generation.
    pub fn remount(&self, dry_run: bool) -> LoadResult {
        if dry_run {
            return self.remount_dry_run();
        }
        self.remount_apply()
    }

    fn remount_dry_run(&self) -> LoadResult {
        let manifest = match Manifest::fetch(self.download.as_ref(), &self.fqrn) {
            Ok(manifest) => manifest,
            Err(CatalogError::Cache(CacheError::NoSpace(_))) => return LoadResult::NoSpace,
            Err(e) => {
                warn!(error = %e, "manifest fetch failed, entering offline mode");
                self.offline.store(true, Ordering::Relaxed);
                return LoadResult::Fail;
            }
        };
        self.offline.store(false, Ordering::Relaxed);

        let current_digest = match self.root_catalog() {
            Ok(root) => root.digest(),
            Err(_) => return LoadResult::Fail,
        };
        if manifest.catalog_digest == current_digest {
            return LoadResult::UpToDate;
        }

        // Stage the new root catalog so the apply step cannot fail on the
        // network.
        let object = BlessedObject::pinned(
            manifest.catalog_digest,
            format!("file catalog at {}:/", self.fqrn),
        );
        match self.fetcher.fetch_catalog(&object) {
            Ok(_) => {}
            Err(CacheError::NoSpace(_)) => return LoadResult::NoSpace,
            Err(e) => {
                warn!(error = %e, "failed to stage new root catalog");
                return LoadResult::Fail;
            }
        }
        debug!(revision = manifest.revision, "staged new catalog revision");
        *self.staged.lock().unwrap() = Some(manifest);
        LoadResult::New
    }

    fn remount_apply(&self) -> LoadResult {
        let Some(manifest) = self.staged.lock().unwrap().take() else {
            return LoadResult::UpToDate;
        };
        let new_root = match self.load_catalog(&manifest.catalog_digest, RepoPath::root(), None) {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "failed to apply staged catalog revision");
                return LoadResult::Fail;
            }
        };
        let old_root = {
            let mut root = self.root.write().unwrap();
            root.replace(new_root)
        };
        if let Some(old_root) = old_root {
            old_root.detach_subtree();
        }
        if let Some(annotation) = &self.annotation {
            annotation.inc_generation(1);
        }
        info!(revision = self.revision(), "switched to catalog revision");
        LoadResult::New
    }

    pub fn offline_mode(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn revision(&self) -> u64 {
        self.root_catalog().map(|root| root.revision()).unwrap_or(0)
    }

    pub fn ttl(&self) -> u64 {
        self.root_catalog()
            .map(|root| root.ttl())
            .unwrap_or(crate::catalog::DEFAULT_TTL)
    }

    pub fn root_hash(&self) -> Option<cvmfs_types::ContentDigest> {
        self.root_catalog().map(|root| root.digest()).ok()
    }

    /// The annotated inode of the repository root directory.
    pub fn root_inode(&self) -> u64 {
        let raw = INODE_OFFSET + 1;
        match &self.annotation {
            Some(annotation) => annotation.annotate(raw),
            None => raw,
        }
    }

    /// Redirect reserved low inodes (the kernel's root inode 1) to the
    /// catalog root.
    pub fn mangle_inode(&self, inode: u64) -> u64 {
        if inode <= INODE_OFFSET {
            self.root_inode()
        } else {
            inode
        }
    }

    pub fn num_catalogs(&self) -> usize {
        self.root_catalog()
            .map(|root| root.count_subtree())
            .unwrap_or(0)
    }

    /// Total entries in the repository as recorded by the root catalog's
    /// counters (an estimate for statfs).
    pub fn all_inodes(&self) -> u64 {
        self.root_catalog()
            .map(|root| root.counters().total())
            .unwrap_or(0)
    }

    /// Inodes owned by currently loaded catalogs.
    pub fn loaded_inodes(&self) -> u64 {
        self.root_catalog()
            .map(|root| root.loaded_inodes())
            .unwrap_or(0)
    }

    /// Watermark of issued inode ranges, carried across hand-over so a
    /// successor continues with disjoint ranges.
    pub fn inode_gauge(&self) -> u64 {
        *self.inode_watermark.lock().unwrap()
    }
}

impl std::fmt::Debug for CatalogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogManager")
            .field("fqrn", &self.fqrn)
            .field("revision", &self.revision())
            .field("num_catalogs", &self.num_catalogs())
            .finish_non_exhaustive()
    }
}
