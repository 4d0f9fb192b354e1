mod convert;
mod file_handle;
mod identity;
pub mod mount;
mod types;

pub use mount::{mount_filesystem, MountedFs};

use convert::{metadata_to_fileattr, std_filetype_to_fuser, time_or_now_to_timespec};
use file_handle::{FileHandle, READ_BUFFER};
use identity::forward_identity;
use types::{InodeData, InodeTable};

use crate::cache::OverlayCache;
use crate::error::io_error_to_libc;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// Reported by `readdir` for children the kernel has not looked up yet. Real
/// inode numbers are assigned by `lookup`.
const UNLISTED_INO: u64 = u64::MAX;

/// Pass-through view of a local directory. Files matching one of the cached
/// patterns are Virtual Objects whose reads and writes go through the block
/// cache; everything else maps directly onto host calls.
pub struct BlockcowFs {
    pub(crate) root: PathBuf,
    cache: Arc<OverlayCache>,
    inodes: Arc<RwLock<InodeTable>>,
    next_ino: Arc<Mutex<u64>>,
    file_handles: Arc<RwLock<HashMap<u64, FileHandle>>>,
    next_fh: Arc<Mutex<u64>>,
    /// Attribute and entry cache timeout handed to the kernel.
    ttl: Duration,
    cached_patterns: Vec<glob::Pattern>,
    /// Cancelled at shutdown to abort in-flight backing store fetches.
    shutdown: CancellationToken,
}

fn dirent_ino(inodes: &InodeTable, parent: u64, name: &OsStr) -> u64 {
    inodes.lookup_child(parent, name).unwrap_or(UNLISTED_INO)
}

impl BlockcowFs {
    pub fn new(
        root: PathBuf,
        cache: Arc<OverlayCache>,
        ttl_secs: u64,
        cached_patterns: Vec<String>,
        shutdown: CancellationToken,
    ) -> crate::error::Result<Self> {
        let compiled_patterns = cached_patterns
            .into_iter()
            .map(|p| {
                glob::Pattern::new(&p).map_err(|e| {
                    crate::error::BlockcowError::Config(format!(
                        "Invalid cached glob pattern '{}': {}",
                        p, e
                    ))
                })
            })
            .collect::<crate::error::Result<Vec<glob::Pattern>>>()?;

        if !root.is_dir() {
            return Err(crate::error::BlockcowError::Config(format!(
                "Root {} is not a directory",
                root.display()
            )));
        }

        Ok(BlockcowFs {
            root,
            cache,
            inodes: Arc::new(RwLock::new(InodeTable::new())),
            // Start at 2 because FUSE reserves inode 1 (FUSE_ROOT_ID) for the root directory
            next_ino: Arc::new(Mutex::new(2)),
            file_handles: Arc::new(RwLock::new(HashMap::new())),
            next_fh: Arc::new(Mutex::new(1)),
            ttl: Duration::from_secs(ttl_secs),
            cached_patterns: compiled_patterns,
            shutdown,
        })
    }

    fn alloc_inode(&self) -> u64 {
        let mut next = self.next_ino.lock();
        let ino = *next;
        *next = next.wrapping_add(1);
        ino
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    fn real_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn inode_path(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes.read().path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        Ok(self.inode_path(parent)?.join(name))
    }

    pub(crate) fn is_cached_path(&self, rel: &Path) -> bool {
        self.cached_patterns.iter().any(|p| p.matches_path(rel))
    }

    /// Cache key for `rel` when it is served through the block cache. Only
    /// provisioned objects qualify; any other file matching a pattern stays a
    /// plain file, since nothing says its bytes belong to the backing store.
    pub(crate) fn cached_object(&self, rel: &Path) -> Option<PathBuf> {
        (self.is_cached_path(rel) && self.cache.is_provisioned(rel)).then(|| rel.to_path_buf())
    }

    /// Provisioned objects keep the size they were registered with.
    fn check_resize(&self, rel: &Path, size: Option<u64>) -> Result<(), i32> {
        if size.is_some() && self.cache.is_provisioned(rel) {
            tracing::warn!("refusing to resize cached object {:?}", rel);
            return Err(libc::EPERM);
        }
        Ok(())
    }

    /// Refuse to unlink, rmdir or rename away anything the engine holds open,
    /// including directories with a provisioned object below them.
    fn check_remove(&self, rel: &Path) -> Result<(), i32> {
        if self.cache.has_provisioned_under(rel) {
            tracing::warn!("{:?} is or contains a cached object in use", rel);
            return Err(libc::EBUSY);
        }
        Ok(())
    }

    fn check_open(&self, cached: Option<&Path>, flags: i32) -> Result<(), i32> {
        match cached {
            Some(key) if flags & libc::O_TRUNC != 0 => {
                tracing::warn!("open: refusing O_TRUNC on cached object {:?}", key);
                Err(libc::EPERM)
            }
            _ => Ok(()),
        }
    }

    /// Bytes a read of `size` at `offset` may return; the object ends at its
    /// registered size.
    fn clamp_read_len(&self, key: &Path, offset: u64, size: u32) -> crate::error::Result<usize> {
        let object_len = self.cache.object_len(key)?;
        Ok((size as u64).min(object_len.saturating_sub(offset)) as usize)
    }

    fn stat(&self, rel: &Path, ino: u64) -> Result<FileAttr, i32> {
        fs::symlink_metadata(self.real_path(rel))
            .map(|m| metadata_to_fileattr(&m, ino))
            .map_err(|e| io_error_to_libc(&e))
    }

    /// Stat `parent/name` and hand out (or reuse) its inode, counting one
    /// kernel lookup.
    fn entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        let rel = self.child_path(parent, name)?;
        let meta = fs::symlink_metadata(self.real_path(&rel)).map_err(|e| io_error_to_libc(&e))?;

        let mut inodes = self.inodes.write();
        let ino = match inodes.lookup_child(parent, name) {
            Some(ino) => {
                if let Some(inode) = inodes.get_mut(ino) {
                    inode.lookups += 1;
                    inode.path = rel;
                }
                ino
            }
            None => {
                let ino = self.alloc_inode();
                inodes.insert(InodeData {
                    inode: ino,
                    parent,
                    name: name.to_os_string(),
                    path: rel,
                    lookups: 1,
                });
                ino
            }
        };

        Ok(metadata_to_fileattr(&meta, ino))
    }

    fn open_handle(&self, file: File, cached: Option<PathBuf>) -> u64 {
        let fh = self.alloc_fh();
        self.file_handles.write().insert(
            fh,
            FileHandle {
                file: Arc::new(file),
                cached,
            },
        );
        fh
    }

    fn handle(&self, fh: u64) -> Option<(Arc<File>, Option<PathBuf>)> {
        self.file_handles
            .read()
            .get(&fh)
            .map(|h| (Arc::clone(&h.file), h.cached.clone()))
    }

    fn apply_setattr(
        &self,
        rel: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> std::io::Result<()> {
        let path = self.real_path(rel);

        if let Some(mode) = mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&path, uid, gid)?;
        }

        if let Some(size) = size {
            match fh.and_then(|fh| self.handle(fh)) {
                Some((file, _)) => file.set_len(size)?,
                None => OpenOptions::new().write(true).open(&path)?.set_len(size)?,
            }
        }

        if atime.is_some() || mtime.is_some() {
            nix::sys::stat::utimensat(
                None,
                &path,
                &time_or_now_to_timespec(atime),
                &time_or_now_to_timespec(mtime),
                nix::sys::stat::UtimensatFlags::NoFollowSymlink,
            )
            .map_err(std::io::Error::from)?;
        }

        Ok(())
    }
}

impl Filesystem for BlockcowFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("blockcow FUSE filesystem initialized at {}", self.root.display());
        Ok(())
    }

    fn destroy(&mut self) {
        self.shutdown.cancel();
        tracing::info!("blockcow FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        match self.entry(parent, name) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.write().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);

        if let Some((file, _)) = fh.and_then(|fh| self.handle(fh)) {
            match file.metadata() {
                Ok(meta) => reply.attr(&self.ttl, &metadata_to_fileattr(&meta, ino)),
                Err(e) => reply.error(io_error_to_libc(&e)),
            }
            return;
        }

        match self.inode_path(ino).and_then(|rel| self.stat(&rel, ino)) {
            Ok(attrs) => reply.attr(&self.ttl, &attrs),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let rel = match self.inode_path(ino) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(errno) = self.check_resize(&rel, size) {
            reply.error(errno);
            return;
        }

        if let Err(e) = self.apply_setattr(&rel, mode, uid, gid, size, atime, mtime, fh) {
            tracing::debug!("setattr({:?}) failed: {}", rel, e);
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.stat(&rel, ino) {
            Ok(attrs) => reply.attr(&self.ttl, &attrs),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let rel = match self.inode_path(ino) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match fs::read_link(self.real_path(&rel)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(rel) => self.real_path(&rel),
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let kind = nix::sys::stat::SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode & !umask & 0o7777);
        if let Err(e) = nix::sys::stat::mknod(&path, kind, perm, rdev as libc::dev_t) {
            tracing::debug!("mknod error: {}", e);
            reply.error(e as i32);
            return;
        }
        if let Err(e) = forward_identity(req, &path) {
            tracing::warn!("mknod: failed to chown {}: {}", path.display(), e);
        }

        match self.entry(parent, name) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(rel) => self.real_path(&rel),
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(e) = fs::DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(&path)
        {
            tracing::debug!("mkdir error: {}", e);
            reply.error(io_error_to_libc(&e));
            return;
        }
        if let Err(e) = forward_identity(req, &path) {
            tracing::warn!("mkdir: failed to chown {}: {}", path.display(), e);
        }

        match self.entry(parent, name) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(errno) = self.check_remove(&rel) {
            reply.error(errno);
            return;
        }

        match fs::remove_file(self.real_path(&rel)) {
            Ok(()) => {
                self.inodes.write().remove_child(parent, name);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(errno) = self.check_remove(&rel) {
            reply.error(errno);
            return;
        }

        match fs::remove_dir(self.real_path(&rel)) {
            Ok(()) => {
                self.inodes.write().remove_child(parent, name);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(rel) => self.real_path(&rel),
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(e) = std::os::unix::fs::symlink(link, &path) {
            tracing::debug!("symlink error: {}", e);
            reply.error(io_error_to_libc(&e));
            return;
        }
        if let Err(e) = forward_identity(req, &path) {
            tracing::warn!("symlink: failed to chown {}: {}", path.display(), e);
        }

        match self.entry(parent, name) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let (src, dest) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(src), Ok(dest)) => (src, dest),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(errno) = self.check_remove(&src).and_then(|()| self.check_remove(&dest)) {
            reply.error(errno);
            return;
        }

        if let Err(e) = fs::rename(self.real_path(&src), self.real_path(&dest)) {
            tracing::debug!("rename error: {}", e);
            reply.error(io_error_to_libc(&e));
            return;
        }

        let mut inodes = self.inodes.write();
        if let Some(ino) = inodes.lookup_child(parent, name) {
            inodes.rename(ino, newparent, newname.to_os_string(), dest);
        }
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (src, dest) = match (self.inode_path(ino), self.child_path(newparent, newname)) {
            (Ok(src), Ok(dest)) => (src, dest),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(e) = fs::hard_link(self.real_path(&src), self.real_path(&dest)) {
            tracing::debug!("link error: {}", e);
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.entry(newparent, newname) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let rel = match self.inode_path(ino) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let cached = self.cached_object(&rel);
        if let Err(errno) = self.check_open(cached.as_deref(), flags) {
            reply.error(errno);
            return;
        }

        let access = flags & libc::O_ACCMODE;
        let truncate = flags & libc::O_TRUNC != 0;

        // The kernel handles O_APPEND offsets; every write here is positional
        let result = OpenOptions::new()
            .read(access != libc::O_WRONLY)
            .write(access != libc::O_RDONLY)
            .truncate(truncate && access != libc::O_RDONLY)
            .open(self.real_path(&rel));

        match result {
            Ok(file) => {
                let fh = self.open_handle(file, cached);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::debug!(
            "read(ino={}, fh={}, offset={}, size={})",
            ino,
            fh,
            offset,
            size
        );
        let Some((file, cached)) = self.handle(fh) else {
            tracing::warn!("read: file handle {} not found", fh);
            reply.error(libc::EBADF);
            return;
        };
        let offset = offset.max(0) as u64;

        READ_BUFFER.with(|buffer| {
            let mut buf = buffer.borrow_mut();

            match cached {
                Some(key) => {
                    let n = match self.clamp_read_len(&key, offset, size) {
                        Ok(n) => n,
                        Err(e) => {
                            reply.error(e.errno());
                            return;
                        }
                    };
                    buf.resize(n, 0u8);

                    match self.cache.read(&key, &mut buf[..n], offset, &self.shutdown) {
                        Ok(read) => reply.data(&buf[..read]),
                        Err(e) => {
                            tracing::error!("error reading cached object {:?}: {}", key, e);
                            reply.error(e.errno());
                        }
                    }
                }
                None => {
                    buf.resize(size as usize, 0u8);
                    match file.read_at(&mut buf[..], offset) {
                        Ok(n) => reply.data(&buf[..n]),
                        Err(e) => {
                            tracing::error!("read: read failed - {}", e);
                            reply.error(io_error_to_libc(&e));
                        }
                    }
                }
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::debug!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );
        let Some((file, cached)) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let offset = offset.max(0) as u64;

        match cached {
            Some(key) => match self.cache.write(&key, data, offset, &self.shutdown) {
                Ok(n) => reply.written(n as u32),
                Err(e) => {
                    tracing::error!("error writing cached object {:?}: {}", key, e);
                    reply.error(e.errno());
                }
            },
            None => match file.write_all_at(data, offset) {
                Ok(()) => reply.written(data.len() as u32),
                Err(e) => {
                    tracing::error!("write: write failed - {}", e);
                    reply.error(io_error_to_libc(&e));
                }
            },
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.file_handles.read().contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.file_handles.write().remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some((file, cached)) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let result = match cached {
            Some(key) => self.cache.sync(&key).map_err(|e| e.errno()),
            None if datasync => file.sync_data().map_err(|e| io_error_to_libc(&e)),
            None => file.sync_all().map_err(|e| io_error_to_libc(&e)),
        };

        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!(
            "create(parent={}, name={:?}, mode={:#o})",
            parent,
            name,
            mode
        );
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let path = self.real_path(&rel);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode & !umask & 0o7777)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("create file error: {}", e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };
        if let Err(e) = forward_identity(req, &path) {
            tracing::warn!("create: failed to chown {}: {}", path.display(), e);
        }

        match self.entry(parent, name) {
            Ok(attrs) => {
                // A freshly created file has nothing to fetch; it stays a plain file
                let fh = self.open_handle(file, None);
                reply.created(&self.ttl, &attrs, 0, fh, flags as u32);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.inode_path(ino) {
            Ok(rel) if self.real_path(&rel).is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, offset={})", ino, offset);
        let (dir_path, parent_ino) = {
            let inodes = self.inodes.read();
            match inodes.peek(ino) {
                Some(inode) => (inode.path.clone(), inode.parent),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            }
        };

        let read_dir = match fs::read_dir(self.real_path(&dir_path)) {
            Ok(rd) => rd,
            Err(e) => {
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        let mut children = Vec::new();
        {
            let inodes = self.inodes.read();
            for entry in read_dir.flatten() {
                let name = entry.file_name();
                let child_ino = dirent_ino(&inodes, ino, &name);
                let kind = entry
                    .file_type()
                    .map(std_filetype_to_fuser)
                    .unwrap_or(FileType::RegularFile);
                children.push((child_ino, kind, name));
            }
        }
        children.sort_by(|a, b| a.2.cmp(&b.2));
        entries.extend(children);

        for (idx, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(child_ino, (idx + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(&self.root) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileBackingStore;
    use fuser::FUSE_ROOT_ID;

    fn fs_with_image(image_len: usize) -> (tempfile::TempDir, BlockcowFs) {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let image = temp_dir.path().join("disk-flat.vmdk");
        fs::write(&image, vec![9u8; image_len]).unwrap();

        let backing = Arc::new(FileBackingStore::image(&image).unwrap());
        let cache = Arc::new(OverlayCache::new(&root, 4096, backing).unwrap());
        let fs = BlockcowFs::new(
            root,
            cache,
            1,
            vec!["*-flat*".to_string()],
            CancellationToken::new(),
        )
        .unwrap();
        (temp_dir, fs)
    }

    #[test]
    fn test_new_rejects_invalid_pattern() {
        let temp_dir = tempfile::tempdir().unwrap();
        let image = temp_dir.path().join("img");
        fs::write(&image, b"x").unwrap();
        let backing = Arc::new(FileBackingStore::image(&image).unwrap());
        let cache = Arc::new(OverlayCache::new(temp_dir.path(), 4096, backing).unwrap());

        let result = BlockcowFs::new(
            temp_dir.path().to_path_buf(),
            cache,
            1,
            vec!["[".to_string()],
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_is_cached_path() {
        let (_dir, fs) = fs_with_image(16);
        assert!(fs.is_cached_path(Path::new("disk-flat.vmdk")));
        assert!(fs.is_cached_path(Path::new("vm/disk-flat.vmdk")));
        assert!(!fs.is_cached_path(Path::new("disk.vmdk")));
    }

    #[test]
    fn test_cached_object_requires_provisioning() {
        let (_dir, fs) = fs_with_image(8192);
        let rel = Path::new("disk-flat.vmdk");
        fs.cache.ensure_created(rel, 8192).unwrap();

        assert_eq!(fs.cached_object(rel), Some(rel.to_path_buf()));
        assert_eq!(fs.cached_object(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_plain_matching_file_keeps_its_bytes_on_reopen() {
        let (_dir, fs) = fs_with_image(8192);
        let rel = Path::new("notes-flat.txt");
        fs::write(fs.real_path(rel), b"HELLO").unwrap();

        assert_eq!(fs.cached_object(rel), None);
        assert!(!fs.cache.is_provisioned(rel));
        assert_eq!(fs.check_open(None, libc::O_RDWR | libc::O_TRUNC), Ok(()));
        assert_eq!(fs::read(fs.real_path(rel)).unwrap(), b"HELLO");
    }

    #[test]
    fn test_check_resize_refuses_cached_objects() {
        let (_dir, fs) = fs_with_image(8192);
        let rel = Path::new("disk-flat.vmdk");
        fs.cache.ensure_created(rel, 8192).unwrap();

        assert_eq!(fs.check_resize(rel, Some(0)), Err(libc::EPERM));
        assert_eq!(fs.check_resize(rel, None), Ok(()));
        assert_eq!(fs.check_resize(Path::new("plain.bin"), Some(0)), Ok(()));
    }

    #[test]
    fn test_check_open_refuses_truncating_cached_objects() {
        let (_dir, fs) = fs_with_image(16);
        let key = Path::new("disk-flat.vmdk");

        assert_eq!(
            fs.check_open(Some(key), libc::O_WRONLY | libc::O_TRUNC),
            Err(libc::EPERM)
        );
        assert_eq!(fs.check_open(Some(key), libc::O_RDWR), Ok(()));
    }

    #[test]
    fn test_check_remove_covers_parent_directories() {
        let (_dir, fs) = fs_with_image(8192);
        fs.cache
            .ensure_created(Path::new("vm/disk-flat.vmdk"), 8192)
            .unwrap();
        fs::write(fs.real_path(Path::new("vm/notes.txt")), b"hi").unwrap();

        assert_eq!(fs.check_remove(Path::new("vm/disk-flat.vmdk")), Err(libc::EBUSY));
        assert_eq!(fs.check_remove(Path::new("vm")), Err(libc::EBUSY));
        assert_eq!(fs.check_remove(Path::new("vm/notes.txt")), Ok(()));
        assert_eq!(fs.check_remove(Path::new("vm2")), Ok(()));
    }

    #[test]
    fn test_clamp_read_len_stops_at_object_end() {
        let (_dir, fs) = fs_with_image(8192);
        let key = Path::new("disk-flat.vmdk");
        fs.cache.ensure_created(key, 5000).unwrap();

        assert_eq!(fs.clamp_read_len(key, 0, 4096).unwrap(), 4096);
        assert_eq!(fs.clamp_read_len(key, 4096, 4096).unwrap(), 904);
        assert_eq!(fs.clamp_read_len(key, 5000, 4096).unwrap(), 0);
        assert_eq!(fs.clamp_read_len(key, 9000, 4096).unwrap(), 0);
        assert!(fs.clamp_read_len(Path::new("missing-flat"), 0, 1).is_err());
    }

    #[test]
    fn test_dirent_ino_never_reports_host_inodes() {
        let (_dir, fs) = fs_with_image(16);
        fs::write(fs.real_path(Path::new("a.txt")), b"a").unwrap();

        assert_eq!(
            dirent_ino(&fs.inodes.read(), FUSE_ROOT_ID, OsStr::new("a.txt")),
            UNLISTED_INO
        );
        let attrs = fs.entry(FUSE_ROOT_ID, OsStr::new("a.txt")).unwrap();
        assert_eq!(
            dirent_ino(&fs.inodes.read(), FUSE_ROOT_ID, OsStr::new("a.txt")),
            attrs.ino
        );
    }

    #[test]
    fn test_entry_reuses_inode_for_same_name() {
        let (_dir, fs) = fs_with_image(16);
        fs::write(fs.real_path(Path::new("a.txt")), b"hello").unwrap();

        let first = fs.entry(FUSE_ROOT_ID, OsStr::new("a.txt")).unwrap();
        let second = fs.entry(FUSE_ROOT_ID, OsStr::new("a.txt")).unwrap();
        assert_eq!(first.ino, second.ino);
        assert_eq!(first.size, 5);
        assert_eq!(fs.inodes.read().peek(first.ino).unwrap().lookups, 2);

        assert_eq!(
            fs.entry(FUSE_ROOT_ID, OsStr::new("missing")).unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_apply_setattr_truncates_and_chmods() {
        let (_dir, fs) = fs_with_image(16);
        let rel = Path::new("plain.bin");
        fs::write(fs.real_path(rel), vec![1u8; 100]).unwrap();

        fs.apply_setattr(rel, Some(0o600), None, None, Some(10), None, None, None)
            .unwrap();

        let meta = fs::metadata(fs.real_path(rel)).unwrap();
        assert_eq!(meta.len(), 10);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
