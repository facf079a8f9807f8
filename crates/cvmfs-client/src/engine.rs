//! The filesystem front-end.
//!
//! One [`Engine`] value owns every piece of runtime state: the catalog
//! manager, the fetcher, the metadata caches, the inode tracker, the open
//! file and directory tables and the remount machinery. The kernel
//! adapter translates each filesystem call into one engine method; the
//! engine returns typed results or a POSIX [`Errno`].
//!
//! Every catalog-facing critical section runs between `fence.enter()` and
//! the guard drop, so a whole call observes exactly one catalog revision.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tracing::{debug, info, warn};

use cvmfs_cache::{BlessedObject, Fetcher, QuotaManager};
use cvmfs_catalog::{CatalogManager, InodeGenerationAnnotation, LoadResult, LookupMode};
use cvmfs_download::HttpDownloader;
use cvmfs_types::{DirectoryEntry, DirentKind, RepoPath, StatInfo};

use crate::caches::MetaCaches;
use crate::chunks::{ChunkFd, ChunkTables};
use crate::dirhandles::{DirectoryHandles, ListingRecord};
use crate::fence::RemountFence;
use crate::tracker::InodeTracker;
use crate::ttl::TtlTimer;

/// Re-check interval after a failed catalog reload, seconds.
pub const SHORT_TERM_TTL: u64 = 180;

/// Slack added to the drain-out deadline beyond the kernel cache timeout.
const RELOAD_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// File descriptors kept back for internal use.
pub const NUM_RESERVED_FD: u32 = 512;

/// Top bit of a kernel-facing handle marks a chunked-file handle (the
/// original stored them as negative values in the handle slot).
const CHUNKED_HANDLE_FLAG: u64 = 1 << 63;

/// DoS guard bounds: first delay drawn from [2, 32] ms, doubling up to
/// 2 s, forgotten after 10 quiet seconds.
const MAX_INIT_IO_DELAY_MS: u64 = 32;
const MAX_IO_DELAY_MS: u64 = 2000;
const FORGET_DOS: Duration = Duration::from_secs(10);

/// A POSIX errno returned to the kernel adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

pub type FsResult<T> = std::result::Result<T, Errno>;

/// Reply to `lookup`/`getattr`: attributes plus the kernel cache
/// lifetime to report (0 during drain-out and maintenance).
#[derive(Debug, Clone)]
pub struct EntryReply {
    pub attr: StatInfo,
    pub timeout: f64,
}

/// Reply to `open`.
#[derive(Debug, Clone, Copy)]
pub struct OpenReply {
    pub handle: u64,
    pub keep_cache: bool,
}

/// Reply to `statfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

/// Reply to `getxattr`/`listxattr` honoring the size probe protocol.
#[derive(Debug, Clone)]
pub enum XattrReply {
    Size(usize),
    Data(Vec<u8>),
}

/// Per-call statistics, exposed through the runtime xattrs.
#[derive(Debug, Default)]
pub struct FsCounters {
    pub num_lookup: AtomicU64,
    pub num_lookup_negative: AtomicU64,
    pub num_stat: AtomicU64,
    pub num_read: AtomicU64,
    pub num_readlink: AtomicU64,
    pub num_open: AtomicU64,
    pub num_dir_open: AtomicU64,
    pub num_forget: AtomicU64,
    pub num_io_error: AtomicI32,
}

/// Static knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub fqrn: String,
    /// Kernel dentry/attr cache lifetime, seconds; 0 disables kernel
    /// caching and short-circuits drain-out.
    pub kcache_timeout: f64,
    /// Cap on the effective catalog TTL, seconds (0 = none).
    pub max_ttl: u64,
    pub max_open_files: u32,
    pub memcache_size: u64,
    /// Pinned revision: the TTL timer never arms.
    pub fixed_catalog: bool,
}

struct IoErrorGuard {
    last: Option<Instant>,
    delay_ms: u64,
}

struct RemountFlags {
    drainout: AtomicBool,
    maintenance: AtomicBool,
    reload_section: AtomicBool,
    drainout_deadline: Mutex<Option<Instant>>,
    /// Wall-clock validity of the current revision; `None` = indefinite.
    valid_until: Mutex<Option<SystemTime>>,
}

/// The client runtime.
pub struct Engine {
    options: EngineOptions,
    catalog_mgr: Arc<CatalogManager>,
    fetcher: Arc<Fetcher>,
    quota: Arc<QuotaManager>,
    annotation: Arc<InodeGenerationAnnotation>,
    /// HTTP transport handle for the runtime xattrs; absent when a
    /// non-HTTP downloader backs the fetcher.
    transport: Option<Arc<HttpDownloader>>,
    pub(crate) fence: RemountFence,
    pub(crate) tracker: InodeTracker,
    pub(crate) caches: MetaCaches,
    pub(crate) dir_handles: DirectoryHandles,
    pub(crate) chunk_tables: ChunkTables,
    file_handles: Mutex<HashMap<u64, Arc<File>>>,
    next_file_handle: AtomicU64,
    open_files: AtomicU32,
    open_dirs: AtomicU32,
    ttl_timer: TtlTimer,
    remount: RemountFlags,
    io_guard: Mutex<IoErrorGuard>,
    pub(crate) counters: FsCounters,
    pub(crate) boot_time: Instant,
    pub(crate) incarnation: Mutex<crate::state::InodeGenerationInfo>,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        catalog_mgr: Arc<CatalogManager>,
        fetcher: Arc<Fetcher>,
        quota: Arc<QuotaManager>,
        annotation: Arc<InodeGenerationAnnotation>,
        transport: Option<Arc<HttpDownloader>>,
    ) -> Self {
        let caches = MetaCaches::new(options.memcache_size);
        let generation_info = crate::state::InodeGenerationInfo {
            version: crate::state::STATE_VERSION,
            initial_revision: catalog_mgr.revision(),
            incarnation: 0,
            inode_generation: annotation.generation(),
        };
        Self {
            options,
            catalog_mgr,
            fetcher,
            quota,
            annotation,
            transport,
            fence: RemountFence::new(),
            tracker: InodeTracker::new(),
            caches,
            dir_handles: DirectoryHandles::new(),
            chunk_tables: ChunkTables::new(),
            file_handles: Mutex::new(HashMap::new()),
            next_file_handle: AtomicU64::new(2),
            open_files: AtomicU32::new(0),
            open_dirs: AtomicU32::new(0),
            ttl_timer: TtlTimer::spawn(),
            remount: RemountFlags {
                drainout: AtomicBool::new(false),
                maintenance: AtomicBool::new(false),
                reload_section: AtomicBool::new(false),
                drainout_deadline: Mutex::new(None),
                valid_until: Mutex::new(None),
            },
            io_guard: Mutex::new(IoErrorGuard {
                last: None,
                delay_ms: 0,
            }),
            counters: FsCounters::default(),
            boot_time: Instant::now(),
            incarnation: Mutex::new(generation_info),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn catalog_mgr(&self) -> &Arc<CatalogManager> {
        &self.catalog_mgr
    }

    pub(crate) fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub(crate) fn annotation(&self) -> &Arc<InodeGenerationAnnotation> {
        &self.annotation
    }

    pub(crate) fn transport(&self) -> Option<&Arc<HttpDownloader>> {
        self.transport.as_ref()
    }

    pub(crate) fn open_files_count(&self) -> u32 {
        self.open_files.load(Ordering::Relaxed)
    }

    pub(crate) fn open_dirs_count(&self) -> u32 {
        self.open_dirs.load(Ordering::Relaxed)
    }

    pub(crate) fn max_usable_fds(&self) -> u32 {
        self.options.max_open_files.saturating_sub(NUM_RESERVED_FD)
    }

    pub(crate) fn catalogs_valid_until(&self) -> Option<SystemTime> {
        *self.remount.valid_until.lock().unwrap()
    }

    pub(crate) fn set_open_files_count(&self, count: u32) {
        self.open_files.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_open_dirs_count(&self, count: u32) {
        self.open_dirs.store(count, Ordering::Relaxed);
    }

    /// Arm the TTL timer after mount (separate from construction, like
    /// all post-daemonize setup).
    pub fn spawn(&self) {
        if self.options.fixed_catalog {
            return;
        }
        let ttl = if self.catalog_mgr.offline_mode() {
            SHORT_TERM_TTL
        } else {
            self.effective_ttl()
        };
        self.arm_ttl(ttl);
    }

    // Remount machinery

    fn effective_ttl(&self) -> u64 {
        let catalog_ttl = self.catalog_mgr.ttl();
        if self.options.max_ttl > 0 {
            catalog_ttl.min(self.options.max_ttl)
        } else {
            catalog_ttl
        }
    }

    fn arm_ttl(&self, seconds: u64) {
        self.ttl_timer.arm(Duration::from_secs(seconds));
        *self.remount.valid_until.lock().unwrap() =
            Some(SystemTime::now() + Duration::from_secs(seconds));
    }

    /// The dentry/attr lifetime reported to the kernel right now.
    pub fn kcache_timeout_reported(&self) -> f64 {
        if self.remount.drainout.load(Ordering::Acquire)
            || self.remount.maintenance.load(Ordering::Acquire)
        {
            0.0
        } else {
            self.options.kcache_timeout
        }
    }

    pub fn in_maintenance_mode(&self) -> bool {
        self.remount.maintenance.load(Ordering::Acquire)
    }

    /// Stop reloading catalogs and report zero kernel cache lifetimes;
    /// precedes state hand-over.
    pub fn enter_maintenance(&self) {
        info!("entering maintenance mode");
        self.remount.maintenance.store(true, Ordering::Release);
        self.ttl_timer.disarm();
    }

    /// Runs at the front of `lookup`, `getattr` and `opendir`: finishes a
    /// pending drain-out and starts a new reload when the TTL has fired.
    pub(crate) fn remount_check(&self) {
        if self.in_maintenance_mode() {
            return;
        }
        self.remount_finish();

        if self.ttl_timer.take_expired() {
            debug!("catalog TTL expired, reload");
            match self.remount_start() {
                LoadResult::New => {} // timer re-armed when the swap lands
                LoadResult::UpToDate => {
                    debug!("catalog up to date");
                    self.arm_ttl(self.effective_ttl());
                }
                LoadResult::Fail | LoadResult::NoSpace => {
                    debug!("reload failed, applying short term TTL");
                    self.arm_ttl(SHORT_TERM_TTL);
                }
            }
        }
    }

    /// Probe for a new revision; on success switch to drain-out mode.
    fn remount_start(&self) -> LoadResult {
        let result = self.catalog_mgr.remount(true);
        if result == LoadResult::New {
            debug!("new catalog revision available, draining out meta-data caches");
            let drain = if self.options.kcache_timeout <= 0.0 {
                // Nothing cached in the kernel, no need to wait for it.
                Duration::ZERO
            } else {
                Duration::from_secs_f64(self.options.kcache_timeout) + RELOAD_SAFETY_MARGIN
            };
            *self.remount.drainout_deadline.lock().unwrap() = Some(Instant::now() + drain);
            self.remount.drainout.store(true, Ordering::Release);
        }
        result
    }

    /// Apply a drained-out revision switch.
    fn remount_finish(&self) {
        if self
            .remount
            .reload_section
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let result = self.try_remount_finish();
        self.remount.reload_section.store(false, Ordering::Release);
        if let Some(result) = result {
            if matches!(result, LoadResult::Fail | LoadResult::NoSpace)
                || self.catalog_mgr.offline_mode()
            {
                debug!("reload/finish failed, applying short term TTL");
                self.arm_ttl(SHORT_TERM_TTL);
            } else {
                info!(revision = self.catalog_mgr.revision(), "switched to catalog revision");
                self.arm_ttl(self.effective_ttl());
            }
        }
    }

    fn try_remount_finish(&self) -> Option<LoadResult> {
        if !self.remount.drainout.load(Ordering::Acquire) {
            return None;
        }
        let deadline = (*self.remount.drainout_deadline.lock().unwrap())?;
        if Instant::now() < deadline {
            return None;
        }
        debug!("caches drained out, applying new catalog");

        self.caches.pause();
        self.caches.drop_all();

        self.fence.block();
        let result = self.catalog_mgr.remount(false);
        self.fence.unblock();

        self.caches.resume();
        self.remount.drainout.store(false, Ordering::Release);
        *self.remount.drainout_deadline.lock().unwrap() = None;
        Some(result)
    }

    // Metadata resolution (cache first, then catalog, patched with live
    // inodes from the tracker)

    pub(crate) fn dirent_for_inode(&self, inode: u64) -> Option<DirectoryEntry> {
        if let Some(dirent) = self.caches.inode_cache.lookup(&inode) {
            return Some(dirent);
        }

        let path = if inode == self.catalog_mgr.root_inode() {
            RepoPath::root()
        } else {
            self.tracker.find_path(inode)?
        };
        match self.catalog_mgr.lookup_path(&path, LookupMode::Sole) {
            Ok(Some(result)) => {
                let mut dirent = result.dirent;
                dirent.inode = inode;
                self.caches.inode_cache.insert(inode, dirent.clone());
                Some(dirent)
            }
            Ok(None) => {
                // Can happen after a reload when the path vanished.
                debug!(inode, "inode resolution failed");
                None
            }
            Err(e) => {
                warn!(inode, error = %e, "catalog failure during inode resolution");
                None
            }
        }
    }

    fn dirent_for_path(&self, path: &RepoPath) -> Option<DirectoryEntry> {
        let live_inode = self.tracker.find_inode(path);
        let md5 = path.md5();

        if let Some(mut dirent) = self.caches.md5_cache.lookup(&md5) {
            if dirent.is_negative() {
                return None;
            }
            if let Some(live) = live_inode {
                dirent.inode = live;
            }
            return Some(dirent);
        }

        match self.catalog_mgr.lookup_path(path, LookupMode::Sole) {
            Ok(Some(result)) => {
                let mut dirent = result.dirent;
                if let Some(live) = live_inode {
                    dirent.inode = live;
                }
                self.caches.md5_cache.insert(md5, dirent.clone());
                Some(dirent)
            }
            Ok(None) => {
                self.caches
                    .md5_cache
                    .insert(md5, DirectoryEntry::negative());
                None
            }
            Err(e) => {
                warn!(path = %path, error = %e, "catalog failure during path resolution");
                None
            }
        }
    }

    fn path_for_inode(&self, inode: u64) -> Option<RepoPath> {
        if let Some(path) = self.caches.path_cache.lookup(&inode) {
            return Some(path);
        }
        if inode == self.catalog_mgr.root_inode() {
            return Some(RepoPath::root());
        }
        let path = self.tracker.find_path(inode)?;
        self.caches.path_cache.insert(inode, path.clone());
        Some(path)
    }

    // Filesystem operations

    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<EntryReply> {
        self.counters.num_lookup.fetch_add(1, Ordering::Relaxed);
        self.remount_check();

        let _fence = self.fence.enter();
        let parent = self.catalog_mgr.mangle_inode(parent);
        debug!(parent, name, "lookup");
        let timeout = self.kcache_timeout_reported();

        let looked_up = self.lookup_impl(parent, name);
        match looked_up {
            Some((dirent, path)) => {
                self.tracker.vfs_get(dirent.inode, &path);
                Ok(EntryReply {
                    attr: dirent.stat_info(),
                    timeout,
                })
            }
            None => {
                self.counters
                    .num_lookup_negative
                    .fetch_add(1, Ordering::Relaxed);
                Err(Errno(libc::ENOENT))
            }
        }
    }

    fn lookup_impl(&self, parent: u64, name: &str) -> Option<(DirectoryEntry, RepoPath)> {
        if name == "." {
            let dirent = self.dirent_for_inode(parent)?;
            let path = self.path_for_inode(parent)?;
            return Some((dirent, path));
        }
        if name == ".." {
            let parent_dirent = self.dirent_for_inode(parent)?;
            if parent_dirent.inode == self.catalog_mgr.root_inode() {
                let mut dirent = parent_dirent;
                dirent.inode = 1;
                return Some((dirent, RepoPath::root()));
            }
            let parent_path = self.path_for_inode(parent)?;
            let grandparent_path = parent_path.parent();
            let dirent = self.dirent_for_path(&grandparent_path)?;
            return Some((dirent, grandparent_path));
        }

        let parent_path = self.path_for_inode(parent)?;
        let path = parent_path.join(name).ok()?;
        let dirent = self.dirent_for_path(&path)?;
        Some((dirent, path))
    }

    pub fn getattr(&self, inode: u64) -> FsResult<EntryReply> {
        self.counters.num_stat.fetch_add(1, Ordering::Relaxed);
        self.remount_check();

        let _fence = self.fence.enter();
        let inode = self.catalog_mgr.mangle_inode(inode);
        debug!(inode, "getattr");
        let dirent = self.dirent_for_inode(inode).ok_or(Errno(libc::ENOENT))?;
        Ok(EntryReply {
            attr: dirent.stat_info(),
            timeout: self.kcache_timeout_reported(),
        })
    }

    pub fn readlink(&self, inode: u64) -> FsResult<String> {
        self.counters.num_readlink.fetch_add(1, Ordering::Relaxed);

        let _fence = self.fence.enter();
        let inode = self.catalog_mgr.mangle_inode(inode);
        debug!(inode, "readlink");
        let dirent = self.dirent_for_inode(inode).ok_or(Errno(libc::ENOENT))?;
        if !dirent.is_symlink() {
            return Err(Errno(libc::EINVAL));
        }
        Ok(dirent.symlink_target)
    }

    pub fn open(&self, inode: u64, flags: i32) -> FsResult<OpenReply> {
        let fence = self.fence.enter();
        let inode = self.catalog_mgr.mangle_inode(inode);
        debug!(inode, "open");

        let dirent = self.dirent_for_inode(inode).ok_or(Errno(libc::ENOENT))?;
        let path = self.path_for_inode(inode).ok_or(Errno(libc::ENOENT))?;

        if flags & libc::O_EXCL != 0 {
            return Err(Errno(libc::EEXIST));
        }
        #[cfg(target_os = "macos")]
        if flags & (libc::O_SHLOCK | libc::O_EXLOCK) != 0 {
            return Err(Errno(libc::EOPNOTSUPP));
        }

        self.counters.num_open.fetch_add(1, Ordering::Relaxed);

        if dirent.is_chunked {
            let reply = self.open_chunked(inode, &path);
            drop(fence);
            return reply;
        }
        drop(fence);

        let object = BlessedObject::new(dirent.checksum, path.to_string());
        match self.fetcher.fetch(&object, dirent.size) {
            Ok(file) => {
                if self.open_files.fetch_add(1, Ordering::AcqRel) >= self.max_usable_fds() {
                    self.open_files.fetch_sub(1, Ordering::AcqRel);
                    warn!("open file descriptor limit exceeded");
                    return Err(Errno(libc::EMFILE));
                }
                let handle = self.next_file_handle.fetch_add(1, Ordering::Relaxed);
                self.file_handles
                    .lock()
                    .unwrap()
                    .insert(handle, Arc::new(file));
                debug!(path = %path, handle, "file opened");
                Ok(OpenReply {
                    handle,
                    keep_cache: false,
                })
            }
            Err(e) => {
                warn!(path = %path, digest = %dirent.checksum, error = %e,
                      "failed to open file");
                self.counters.num_io_error.fetch_add(1, Ordering::Relaxed);
                self.io_error_backoff();
                Err(Errno(libc::EIO))
            }
        }
    }

    /// Register a chunked-file open; chunk fetches are deferred to
    /// `read`.
    fn open_chunked(&self, inode: u64, path: &RepoPath) -> FsResult<OpenReply> {
        debug!(path = %path, "chunked file opened (download delayed to read)");
        if self.open_files.fetch_add(1, Ordering::AcqRel) >= self.max_usable_fds() {
            self.open_files.fetch_sub(1, Ordering::AcqRel);
            warn!("open file descriptor limit exceeded");
            return Err(Errno(libc::EMFILE));
        }

        let chunks = match self.chunk_tables.chunks_of(inode) {
            Some((chunks, _)) => chunks,
            None => match self.catalog_mgr.list_file_chunks(path) {
                Ok(list) if !list.is_empty() => Arc::new(list),
                Ok(_) => {
                    warn!(path = %path,
                          "file is marked chunked but no chunks found in the catalog");
                    self.open_files.fetch_sub(1, Ordering::AcqRel);
                    return Err(Errno(libc::EIO));
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to load chunk list");
                    self.open_files.fetch_sub(1, Ordering::AcqRel);
                    return Err(Errno(libc::EIO));
                }
            },
        };
        let handle = self.chunk_tables.open(inode, chunks, path.clone());
        Ok(OpenReply {
            handle: handle | CHUNKED_HANDLE_FLAG,
            keep_cache: false,
        })
    }

    pub fn read(&self, inode: u64, handle: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        self.counters.num_read.fetch_add(1, Ordering::Relaxed);

        if handle & CHUNKED_HANDLE_FLAG != 0 {
            return self.read_chunked(inode, handle & !CHUNKED_HANDLE_FLAG, offset, size);
        }

        let file = self
            .file_handles
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(Errno(libc::EBADF))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let nbytes = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| Errno(e.raw_os_error().unwrap_or(libc::EIO)))?;
            if nbytes == 0 {
                break;
            }
            filled += nbytes;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn read_chunked(&self, inode: u64, handle: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let (chunks, path) = self
            .chunk_tables
            .chunks_of(inode)
            .ok_or(Errno(libc::EBADF))?;

        // Serialize on this handle; reads on other handles proceed.
        let _handle_lock = self.chunk_tables.lock_handle(handle);
        let mut chunk_fd = self
            .chunk_tables
            .take_fd(handle)
            .ok_or(Errno(libc::EBADF))?;

        let result = self.read_chunked_locked(&chunks, &path, &mut chunk_fd, offset, size);
        self.chunk_tables.put_fd(handle, chunk_fd);
        result
    }

    fn read_chunked_locked(
        &self,
        chunks: &cvmfs_types::FileChunkList,
        path: &RepoPath,
        chunk_fd: &mut ChunkFd,
        offset: u64,
        size: usize,
    ) -> FsResult<Vec<u8>> {
        let Some(mut chunk_idx) = chunks.chunk_index_for_offset(offset) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(size);
        let mut offset_in_chunk = offset.saturating_sub(chunks.get(chunk_idx).unwrap().offset);

        while out.len() < size && chunk_idx < chunks.len() {
            let chunk = chunks.get(chunk_idx).unwrap();
            if offset_in_chunk >= chunk.size {
                break; // read starts past EOF
            }

            if chunk_fd.file.is_none() || chunk_fd.chunk_idx != Some(chunk_idx) {
                chunk_fd.file = None;
                match self.fetcher.fetch_chunk(chunk, path.as_str()) {
                    Ok(file) => {
                        chunk_fd.file = Some(file);
                        chunk_fd.chunk_idx = Some(chunk_idx);
                    }
                    Err(e) => {
                        warn!(path = %path, chunk = chunk_idx, error = %e,
                              "failed to fetch chunk");
                        self.counters.num_io_error.fetch_add(1, Ordering::Relaxed);
                        return Err(Errno(libc::EIO));
                    }
                }
            }

            let want = (size - out.len()).min((chunk.size - offset_in_chunk) as usize);
            let mut buf = vec![0u8; want];
            let file = chunk_fd.file.as_ref().unwrap();
            let mut filled = 0;
            while filled < want {
                let nbytes = file
                    .read_at(&mut buf[filled..], offset_in_chunk + filled as u64)
                    .map_err(|e| Errno(e.raw_os_error().unwrap_or(libc::EIO)))?;
                if nbytes == 0 {
                    break;
                }
                filled += nbytes;
            }
            out.extend_from_slice(&buf[..filled]);
            if filled < want {
                break; // short chunk on disk, do not spin
            }

            chunk_idx += 1;
            offset_in_chunk = 0;
        }
        Ok(out)
    }

    pub fn release(&self, inode: u64, handle: u64) -> FsResult<()> {
        debug!(inode, handle, "release");
        if handle & CHUNKED_HANDLE_FLAG != 0 {
            let raw_handle = handle & !CHUNKED_HANDLE_FLAG;
            self.chunk_tables.release(inode, raw_handle);
            self.open_files.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }
        if self
            .file_handles
            .lock()
            .unwrap()
            .remove(&handle)
            .is_some()
        {
            self.open_files.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn opendir(&self, inode: u64) -> FsResult<u64> {
        self.remount_check();

        let _fence = self.fence.enter();
        let inode = self.catalog_mgr.mangle_inode(inode);
        debug!(inode, "opendir");

        let path = self.path_for_inode(inode).ok_or(Errno(libc::ENOENT))?;
        let dirent = self.dirent_for_inode(inode).ok_or(Errno(libc::ENOENT))?;
        if !dirent.is_directory() {
            return Err(Errno(libc::ENOTDIR));
        }

        let mut records = Vec::new();
        records.push(ListingRecord {
            name: ".".to_string(),
            inode: dirent.inode,
            kind: DirentKind::Directory,
        });
        if dirent.inode != self.catalog_mgr.root_inode() {
            if let Some(parent_dirent) = self.dirent_for_path(&path.parent()) {
                records.push(ListingRecord {
                    name: "..".to_string(),
                    inode: parent_dirent.inode,
                    kind: DirentKind::Directory,
                });
            }
        }

        let listing = self
            .catalog_mgr
            .listing(&path)
            .map_err(|_| Errno(libc::EIO))?;
        for entry in listing {
            let Ok(entry_path) = path.join(&entry.name) else {
                continue;
            };
            // Fix the inode to the live one.
            let Some(fixed) = self.dirent_for_path(&entry_path) else {
                debug!(path = %entry_path, "listing entry vanished, skipping");
                continue;
            };
            records.push(ListingRecord {
                name: entry.name,
                inode: fixed.inode,
                kind: fixed.kind,
            });
        }

        let handle = self.dir_handles.insert(records);
        self.counters.num_dir_open.fetch_add(1, Ordering::Relaxed);
        self.open_dirs.fetch_add(1, Ordering::AcqRel);
        debug!(handle, inode, "directory listing materialized");
        Ok(handle)
    }

    pub fn readdir(&self, handle: u64, offset: usize) -> FsResult<Vec<(usize, ListingRecord)>> {
        debug!(handle, offset, "readdir");
        self.dir_handles
            .slice(handle, offset)
            .ok_or(Errno(libc::EINVAL))
    }

    pub fn releasedir(&self, handle: u64) -> FsResult<()> {
        debug!(handle, "releasedir");
        if self.dir_handles.release(handle) {
            self.open_dirs.fetch_sub(1, Ordering::AcqRel);
            Ok(())
        } else {
            Err(Errno(libc::EINVAL))
        }
    }

    pub fn statfs(&self) -> FsResult<StatFsReply> {
        // An unmanaged cache reports all-zero so df ignores the mount.
        let capacity = self.quota.capacity();
        if capacity == 0 {
            return Ok(StatFsReply::default());
        }

        let size = self.quota.size();
        let (blocks, available) = if capacity == u64::MAX {
            (size, 0)
        } else {
            (capacity, capacity.saturating_sub(size))
        };

        let _fence = self.fence.enter();
        let all_inodes = self.catalog_mgr.all_inodes();
        let loaded = self.catalog_mgr.loaded_inodes();
        Ok(StatFsReply {
            blocks,
            bfree: available,
            bavail: available,
            files: all_inodes,
            ffree: all_inodes.saturating_sub(loaded),
        })
    }

    pub fn forget(&self, inode: u64, nlookup: u64) -> FsResult<()> {
        self.counters.num_forget.fetch_add(1, Ordering::Relaxed);
        // The kernel's own root reference never drains.
        if inode == 1 {
            return Ok(());
        }

        let _fence = self.fence.enter();
        let inode = self.catalog_mgr.mangle_inode(inode);
        debug!(inode, nlookup, "forget");
        let dropped = self.tracker.vfs_put(inode, nlookup.min(u32::MAX as u64) as u32);
        if dropped {
            self.caches.forget_inode(inode);
        }
        Ok(())
    }

    /// Evict a file's content from the cache (control interface).
    pub fn evict(&self, path: &RepoPath) -> bool {
        let dirent = {
            let _fence = self.fence.enter();
            self.dirent_for_path(path)
        };
        match dirent {
            Some(dirent) if dirent.is_regular() => {
                self.quota.remove(&dirent.checksum);
                true
            }
            _ => false,
        }
    }

    /// Pin a file's content in the cache (control interface). Chunked
    /// files pin every chunk.
    pub fn pin(&self, path: &RepoPath) -> bool {
        let dirent = {
            let _fence = self.fence.enter();
            self.dirent_for_path(path)
        };
        let Some(dirent) = dirent else { return false };
        if !dirent.is_regular() {
            return false;
        }
        if dirent.is_chunked {
            let Ok(chunks) = self.catalog_mgr.list_file_chunks(path) else {
                return false;
            };
            for chunk in chunks.iter() {
                if !self.quota.pin(&chunk.digest, chunk.size) {
                    return false;
                }
                if self.fetcher.fetch_chunk(chunk, path.as_str()).is_err() {
                    self.quota.unpin(&chunk.digest);
                    return false;
                }
            }
            return true;
        }
        if !self.quota.pin(&dirent.checksum, dirent.size) {
            return false;
        }
        let object = BlessedObject::pinned(dirent.checksum, path.to_string());
        if self.fetcher.fetch(&object, dirent.size).is_err() {
            self.quota.unpin(&dirent.checksum);
            return false;
        }
        true
    }

    /// Squid/mirror DoS guard: pace repeated open failures.
    fn io_error_backoff(&self) {
        let sleep_ms = {
            let mut guard = self.io_guard.lock().unwrap();
            let now = Instant::now();
            let sleep_ms = match guard.last {
                Some(last) if now.duration_since(last) < FORGET_DOS => {
                    let current = guard.delay_ms;
                    if guard.delay_ms < MAX_IO_DELAY_MS {
                        guard.delay_ms = (guard.delay_ms * 2).min(MAX_IO_DELAY_MS);
                    }
                    current
                }
                _ => {
                    guard.delay_ms = rand::thread_rng().gen_range(2..=MAX_INIT_IO_DELAY_MS);
                    0
                }
            };
            guard.last = Some(now);
            sleep_ms
        };
        if sleep_ms > 0 {
            std::thread::sleep(Duration::from_millis(sleep_ms));
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("fqrn", &self.options.fqrn)
            .field("revision", &self.catalog_mgr.revision())
            .field("open_files", &self.open_files_count())
            .field("open_dirs", &self.open_dirs_count())
            .finish_non_exhaustive()
    }
}
