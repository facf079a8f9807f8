//! FUSE adapter.
//!
//! A thin shim translating `fuser` callbacks into [`Engine`] calls and
//! engine results back into replies. All filesystem semantics live in the
//! engine; this module only converts types.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::ffi::OsStr;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
        ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
    };
    use tracing::debug;

    use cvmfs_types::{DirentKind, StatInfo};

    use crate::engine::{Engine, XattrReply};

    const BLOCK_SIZE: u32 = 4096;

    /// `fuser::Filesystem` implementation backed by an [`Engine`].
    pub struct CvmfsFilesystem {
        engine: Arc<Engine>,
    }

    impl CvmfsFilesystem {
        pub fn new(engine: Arc<Engine>) -> Self {
            Self { engine }
        }

        fn file_attr(&self, stat: &StatInfo) -> FileAttr {
            let mtime = if stat.mtime >= 0 {
                UNIX_EPOCH + Duration::from_secs(stat.mtime as u64)
            } else {
                UNIX_EPOCH
            };
            FileAttr {
                ino: stat.ino,
                size: stat.size,
                blocks: stat.size.div_ceil(u64::from(BLOCK_SIZE)),
                atime: mtime,
                mtime,
                ctime: mtime,
                crtime: mtime,
                kind: kind_of(stat.kind),
                perm: (stat.mode & 0o7777) as u16,
                nlink: stat.nlink,
                uid: stat.uid,
                gid: stat.gid,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE,
            }
        }
    }

    fn kind_of(kind: DirentKind) -> FileType {
        match kind {
            DirentKind::Directory => FileType::Directory,
            DirentKind::Symlink => FileType::Symlink,
            _ => FileType::RegularFile,
        }
    }

    fn name_str(name: &OsStr) -> Option<&str> {
        name.to_str()
    }

    impl Filesystem for CvmfsFilesystem {
        fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
            debug!("filesystem initialized");
            Ok(())
        }

        fn destroy(&mut self) {
            debug!("filesystem destroyed");
        }

        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(name) = name_str(name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.engine.lookup(parent, name) {
                Ok(entry) => {
                    let ttl = Duration::from_secs_f64(entry.timeout.max(0.0));
                    reply.entry(&ttl, &self.file_attr(&entry.attr), 0);
                }
                Err(errno) => reply.error(errno.0),
            }
        }

        fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
            let _ = self.engine.forget(ino, nlookup);
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
            match self.engine.getattr(ino) {
                Ok(entry) => {
                    let ttl = Duration::from_secs_f64(entry.timeout.max(0.0));
                    reply.attr(&ttl, &self.file_attr(&entry.attr));
                }
                Err(errno) => reply.error(errno.0),
            }
        }

        fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
            match self.engine.readlink(ino) {
                Ok(target) => reply.data(target.as_bytes()),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
            match self.engine.open(ino, flags) {
                Ok(open) => {
                    let fuse_flags = if open.keep_cache {
                        fuser::consts::FOPEN_KEEP_CACHE
                    } else {
                        0
                    };
                    reply.opened(open.handle, fuse_flags);
                }
                Err(errno) => reply.error(errno.0),
            }
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            match self
                .engine
                .read(ino, fh, offset.max(0) as u64, size as usize)
            {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            match self.engine.release(ino, fh) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            match self.engine.opendir(ino) {
                Ok(handle) => reply.opened(handle, 0),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            match self.engine.readdir(fh, offset.max(0) as usize) {
                Ok(records) => {
                    for (idx, record) in records {
                        let full = reply.add(
                            record.inode,
                            (idx + 1) as i64,
                            kind_of(record.kind),
                            &record.name,
                        );
                        if full {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(errno) => reply.error(errno.0),
            }
        }

        fn releasedir(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            reply: ReplyEmpty,
        ) {
            match self.engine.releasedir(fh) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
            match self.engine.statfs() {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.bfree,
                    stat.bavail,
                    stat.files,
                    stat.ffree,
                    1, // bsize: sizes are reported in bytes
                    255,
                    1,
                ),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn getxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            let Some(name) = name_str(name) else {
                reply.error(libc::ENODATA);
                return;
            };
            match self.engine.getxattr(ino, name, size as usize) {
                Ok(XattrReply::Size(len)) => reply.size(len as u32),
                Ok(XattrReply::Data(data)) => reply.data(&data),
                Err(errno) => reply.error(errno.0),
            }
        }

        fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
            match self.engine.listxattr(ino, size as usize) {
                Ok(XattrReply::Size(len)) => reply.size(len as u32),
                Ok(XattrReply::Data(data)) => reply.data(&data),
                Err(errno) => reply.error(errno.0),
            }
        }
    }

    /// Mount the engine at `mountpoint` and serve until unmounted.
    pub fn mount(engine: Arc<Engine>, mountpoint: &std::path::Path) -> std::io::Result<()> {
        let fqrn = engine.options().fqrn.clone();
        let options = vec![
            fuser::MountOption::RO,
            fuser::MountOption::NoDev,
            fuser::MountOption::NoSuid,
            fuser::MountOption::FSName("cvmfs2".to_string()),
            fuser::MountOption::Subtype(fqrn),
            fuser::MountOption::DefaultPermissions,
        ];
        fuser::mount2(CvmfsFilesystem::new(engine), mountpoint, &options)
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::sync::Arc;

    use crate::engine::Engine;

    /// Stub used when FUSE support is compiled out.
    pub struct CvmfsFilesystem;

    pub fn mount(_engine: Arc<Engine>, _mountpoint: &std::path::Path) -> std::io::Result<()> {
        Err(std::io::Error::other(
            "FUSE support not compiled in (enable the `fuse` feature on Linux)",
        ))
    }
}

pub use imp::{mount, CvmfsFilesystem};
