//! Mounting: the kernel file system contract and its FUSE driver.
//!
//! [`Operations`] is the path-based contract the adapters implement
//! ([`crate::fs::RemoteFs`] and [`crate::cache::CachedFs`]). The [`Driver`]
//! binds an implementation to [`fuser::Filesystem`]: it keeps the
//! inode-to-path translation the kernel protocol requires, converts errors
//! into negative errno replies, and hands each potentially blocking
//! operation to a thread pool so that many kernel requests proceed in
//! parallel even though they all arrive through one session loop.
//!
//! The driver owns the operations object for the lifetime of the mount;
//! `destroy` drains the pool and then runs the adapter's own teardown, so
//! unmount does not return while operations are still in flight.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use log::warn;
use parking_lot::RwLock;
use threadpool::ThreadPool;

use crate::error::Result;
use crate::fs::{Attributes, StatVfs, UTIME_NOW, UTIME_OMIT};

/// Invoked once the kernel has finished mounting the file system.
pub type MountCallback = Box<dyn Fn() + Send + Sync>;

/// How long the kernel may cache attributes and entries we reply with.
const TTL: Duration = Duration::from_secs(1);

/// The operations a mounted file system must provide.
///
/// All paths are absolute within the mount. Implementations are invoked
/// from many threads simultaneously and must be reentrant; returned errors
/// are translated to errno by the driver.
pub trait Operations: Send + Sync + 'static {
    /// The file system has been mounted.
    fn init(&self) {}

    /// The file system is being unmounted.
    fn destroy(&self) {}

    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes>;
    fn readlink(&self, path: &str) -> Result<String>;
    /// List a directory, always including `.` and `..`.
    fn readdir(&self, path: &str) -> Result<Vec<String>>;
    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    /// Create a symlink at `path` pointing to `target`.
    fn symlink(&self, path: &str, target: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn rename(&self, old: &str, new: &str) -> Result<()>;
    /// Create a hard link at `path` to the existing `target`.
    fn link(&self, path: &str, target: &str) -> Result<()>;
    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()>;
    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()>;
    /// Set timestamps in nanoseconds; [`UTIME_NOW`]/[`UTIME_OMIT`] are
    /// honored per field.
    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()>;
    fn open(&self, path: &str, flags: i32) -> Result<u64>;
    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64>;
    fn read(&self, path: &str, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>>;
    fn write(&self, path: &str, fh: u64, offset: i64, data: &[u8]) -> Result<u64>;
    fn statfs(&self, path: &str) -> Result<StatVfs>;
    fn release(&self, path: &str, fh: u64) -> Result<()>;
    fn flush(&self, path: &str, fh: u64) -> Result<()>;
    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> Result<()>;
    fn lseek(&self, path: &str, fh: u64, offset: i64, whence: i32) -> Result<i64>;
}

/// Mount-time options.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub filesystem_name: String,
    /// Let the kernel enforce permission checks from the cached modes.
    pub default_permissions: bool,
    /// Unmount automatically when the driver process exits.
    pub auto_unmount: bool,
    /// Threads handling kernel requests concurrently.
    pub workers: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            filesystem_name: crate::FILESYSTEM_NAME.to_string(),
            default_permissions: true,
            auto_unmount: true,
            workers: 8,
        }
    }
}

/// A mounted file system; dropping it unmounts.
pub struct Session {
    background: fuser::BackgroundSession,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Block until the file system is unmounted.
    pub fn join(self) {
        self.background.join();
    }
}

/// Mount `ops` at `mountpoint` and return the running session.
pub fn mount(
    ops: Arc<dyn Operations>,
    mountpoint: &Path,
    config: &MountConfig,
) -> std::io::Result<Session> {
    let mut options = vec![MountOption::FSName(config.filesystem_name.clone())];
    if config.default_permissions {
        options.push(MountOption::DefaultPermissions);
    }
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let driver = Driver {
        state: Arc::new(State {
            ops,
            inodes: InodeTable::new(),
            pool: ThreadPool::new(config.workers.max(1)),
        }),
    };

    let background = fuser::spawn_mount2(driver, mountpoint, &options)?;
    Ok(Session { background })
}

struct State {
    ops: Arc<dyn Operations>,
    inodes: InodeTable,
    pool: ThreadPool,
}

/// FUSE driver translating the inode protocol onto [`Operations`].
struct Driver {
    state: Arc<State>,
}

/// Bidirectional inode/path map with per-inode lookup counts.
///
/// The root is inode 1. Inodes are allocated on first sight of a path and
/// dropped again once the kernel has forgotten all its lookups, so the
/// table stays proportional to the kernel's own dentry cache.
struct InodeTable {
    inner: RwLock<Tables>,
}

struct Tables {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

struct InodeEntry {
    path: String,
    lookups: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            fuser::FUSE_ROOT_ID,
            InodeEntry {
                path: "/".to_string(),
                lookups: 0,
            },
        );

        let mut by_path = HashMap::new();
        by_path.insert("/".to_string(), fuser::FUSE_ROOT_ID);

        InodeTable {
            inner: RwLock::new(Tables {
                by_ino,
                by_path,
                next_ino: fuser::FUSE_ROOT_ID + 1,
            }),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inner.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Inode for a path the kernel just looked up; bumps the lookup count.
    fn remember(&self, path: &str) -> u64 {
        let mut tables = self.inner.write();

        if let Some(&ino) = tables.by_path.get(path) {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = tables.next_ino;
        tables.next_ino += 1;
        tables.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                lookups: 1,
            },
        );
        tables.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Inode for a readdir row; registered paths keep their inode, others
    /// get a stable synthetic one without growing the table.
    fn peek(&self, path: &str) -> u64 {
        if let Some(&ino) = self.inner.read().by_path.get(path) {
            return ino;
        }

        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let ino = hasher.finish();
        if ino <= fuser::FUSE_ROOT_ID {
            ino + 2
        } else {
            ino
        }
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        if ino == fuser::FUSE_ROOT_ID {
            return;
        }

        let mut tables = self.inner.write();
        let remove = match tables.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };

        if remove {
            if let Some(entry) = tables.by_ino.remove(&ino) {
                if tables.by_path.get(&entry.path) == Some(&ino) {
                    tables.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// A path stopped existing; its inode stays alive until forgotten, but
    /// the name may be reused for a new file.
    fn unlink_path(&self, path: &str) {
        self.inner.write().by_path.remove(path);
    }

    /// Move a path and everything under it.
    fn rename_path(&self, old: &str, new: &str) {
        let mut tables = self.inner.write();

        let prefix = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<u64> = tables
            .by_ino
            .iter()
            .filter(|(_, entry)| entry.path == old || entry.path.starts_with(&prefix))
            .map(|(&ino, _)| ino)
            .collect();

        for ino in moved {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                let renamed = if entry.path == old {
                    new.to_string()
                } else {
                    format!("{new}{}", &entry.path[old.len()..])
                };

                tables.by_path.remove(&entry.path);
                entry.path = renamed.clone();
                tables.by_path.insert(renamed, ino);
            }
        }
    }
}

/// Join a parent path and a directory entry name.
fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn name_str(name: &OsStr) -> Option<&str> {
    name.to_str()
}

fn system_time_from_ns(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

fn ns_from_time_or_now(time: Option<TimeOrNow>) -> i64 {
    match time {
        None => UTIME_OMIT,
        Some(TimeOrNow::Now) => UTIME_NOW,
        Some(TimeOrNow::SpecificTime(time)) => match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_nanos() as i64,
            Err(before) => -(before.duration().as_nanos() as i64),
        },
    }
}

fn file_type_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size.max(0) as u64,
        blocks: attrs.blocks.max(0) as u64,
        atime: system_time_from_ns(attrs.atime_ns),
        mtime: system_time_from_ns(attrs.mtime_ns),
        ctime: system_time_from_ns(attrs.ctime_ns),
        crtime: system_time_from_ns(attrs.ctime_ns),
        kind: file_type_of(attrs.mode),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink as u32,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: attrs.blksize.max(0) as u32,
        flags: 0,
    }
}

impl State {
    /// Look up a path and register its inode, replying with the entry.
    fn reply_entry(&self, path: String, fh: Option<u64>, reply: ReplyEntry) {
        match self.ops.getattr(&path, fh) {
            Ok(attrs) => {
                let ino = self.inodes.remember(&path);
                reply.entry(&TTL, &file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}

macro_rules! resolve_path {
    ($state:expr, $ino:expr, $reply:expr) => {
        match $state.inodes.path_of($ino) {
            Some(path) => path,
            None => {
                $reply.error(libc::ENOENT);
                return;
            }
        }
    };
}

macro_rules! resolve_child {
    ($state:expr, $parent:expr, $name:expr, $reply:expr) => {{
        let parent = resolve_path!($state, $parent, $reply);
        match name_str(&$name) {
            Some(name) => join_path(&parent, name),
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    }};
}

impl Filesystem for Driver {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        self.state.ops.init();
        Ok(())
    }

    fn destroy(&mut self) {
        // Let in-flight operations finish before the adapter tears down.
        self.state.pool.join();
        self.state.ops.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);
            state.reply_entry(path, None, reply);
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.state.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.getattr(&path, None) {
                Ok(attrs) => reply.attr(&TTL, &file_attr(ino, &attrs)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
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
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);

            let result = (|| -> Result<()> {
                if let Some(mode) = mode {
                    state.ops.chmod(&path, fh, mode)?;
                }
                if uid.is_some() || gid.is_some() {
                    // -1 leaves the respective id unchanged.
                    state.ops.chown(
                        &path,
                        fh,
                        uid.unwrap_or(u32::MAX),
                        gid.unwrap_or(u32::MAX),
                    )?;
                }
                if let Some(size) = size {
                    state.ops.truncate(&path, fh, size as i64)?;
                }
                if atime.is_some() || mtime.is_some() {
                    state.ops.utimens(
                        &path,
                        fh,
                        ns_from_time_or_now(atime),
                        ns_from_time_or_now(mtime),
                    )?;
                }
                Ok(())
            })();

            if let Err(e) = result {
                reply.error(e.errno());
                return;
            }

            match state.ops.getattr(&path, fh) {
                Ok(attrs) => reply.attr(&TTL, &file_attr(ino, &attrs)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.readlink(&path) {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);
            match state.ops.mknod(&path, mode, rdev as u64) {
                Ok(()) => state.reply_entry(path, None, reply),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);
            match state.ops.mkdir(&path, mode) {
                Ok(()) => state.reply_entry(path, None, reply),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);
            match state.ops.unlink(&path) {
                Ok(()) => {
                    state.inodes.unlink_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);
            match state.ops.rmdir(&path) {
                Ok(()) => {
                    state.inodes.unlink_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let state = Arc::clone(&self.state);
        let link_name = link_name.to_os_string();
        let target = target.to_path_buf();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, link_name, reply);
            let target = match target.to_str() {
                Some(target) => target.to_string(),
                None => {
                    reply.error(libc::EINVAL);
                    return;
                }
            };

            match state.ops.symlink(&path, &target) {
                Ok(()) => state.reply_entry(path, None, reply),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // Rename flags (noreplace/exchange) are not part of the contract.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.state.pool.execute(move || {
            let old = resolve_child!(state, parent, name, reply);
            let new = resolve_child!(state, newparent, newname, reply);

            match state.ops.rename(&old, &new) {
                Ok(()) => {
                    state.inodes.rename_path(&old, &new);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let state = Arc::clone(&self.state);
        let newname = newname.to_os_string();
        self.state.pool.execute(move || {
            let target = resolve_path!(state, ino, reply);
            let path = resolve_child!(state, newparent, newname, reply);

            match state.ops.link(&path, &target) {
                Ok(()) => state.reply_entry(path, None, reply),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.open(&path, flags) {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let state = Arc::clone(&self.state);
        let name = name.to_os_string();
        self.state.pool.execute(move || {
            let path = resolve_child!(state, parent, name, reply);

            let fh = match state.ops.create(&path, flags, mode) {
                Ok(fh) => fh,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };

            match state.ops.getattr(&path, Some(fh)) {
                Ok(attrs) => {
                    let ino = state.inodes.remember(&path);
                    reply.created(&TTL, &file_attr(ino, &attrs), 0, fh, 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
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
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.read(&path, fh, offset, size as u64) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let state = Arc::clone(&self.state);
        let data = data.to_vec();
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.write(&path, fh, offset, &data) {
                Ok(written) => reply.written(written as u32),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.flush(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
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
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.release(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.fsync(&path, fh, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);

            let names = match state.ops.readdir(&path) {
                Ok(names) => names,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };

            for (i, name) in names.iter().enumerate().skip(offset as usize) {
                let (entry_ino, kind) = match name.as_str() {
                    "." | ".." => (ino, FileType::Directory),
                    name => {
                        // The kind is advisory here; the kernel stats the
                        // entry itself when it matters.
                        (state.inodes.peek(&join_path(&path, name)), FileType::RegularFile)
                    }
                };

                if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                    break;
                }
            }

            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.statfs(&path) {
                Ok(st) => reply.statfs(
                    st.blocks,
                    st.bfree,
                    st.bavail,
                    st.files,
                    st.ffree,
                    st.bsize as u32,
                    st.namemax as u32,
                    st.frsize as u32,
                ),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let state = Arc::clone(&self.state);
        self.state.pool.execute(move || {
            let path = resolve_path!(state, ino, reply);
            match state.ops.lseek(&path, fh, offset, whence) {
                Ok(offset) => reply.offset(offset),
                Err(e) => reply.error(e.errno()),
            }
        });
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Safety net for sessions that end without a destroy message.
        if self.state.pool.active_count() > 0 || self.state.pool.queued_count() > 0 {
            warn!("dropping fuse driver with operations still queued");
            self.state.pool.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_translates_and_forgets() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(fuser::FUSE_ROOT_ID).as_deref(), Some("/"));

        let ino = table.remember("/usr/lib");
        assert_eq!(table.path_of(ino).as_deref(), Some("/usr/lib"));
        assert_eq!(table.remember("/usr/lib"), ino);

        // Two lookups, two forgets.
        table.forget(ino, 1);
        assert_eq!(table.path_of(ino).as_deref(), Some("/usr/lib"));
        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);
    }

    #[test]
    fn rename_moves_descendants() {
        let table = InodeTable::new();
        let dir = table.remember("/a");
        let file = table.remember("/a/file");

        table.rename_path("/a", "/b");

        assert_eq!(table.path_of(dir).as_deref(), Some("/b"));
        assert_eq!(table.path_of(file).as_deref(), Some("/b/file"));
        assert_eq!(table.remember("/b/file"), file);
    }

    #[test]
    fn unlinked_paths_get_fresh_inodes() {
        let table = InodeTable::new();
        let ino = table.remember("/tmp/file");

        table.unlink_path("/tmp/file");
        let reused = table.remember("/tmp/file");

        assert_ne!(ino, reused);
        // The stale inode still resolves until the kernel forgets it.
        assert_eq!(table.path_of(ino).as_deref(), Some("/tmp/file"));
    }

    #[test]
    fn timestamps_convert_both_ways() {
        assert_eq!(ns_from_time_or_now(None), UTIME_OMIT);
        assert_eq!(ns_from_time_or_now(Some(TimeOrNow::Now)), UTIME_NOW);

        let time = UNIX_EPOCH + Duration::from_nanos(1_234_567_890);
        assert_eq!(
            ns_from_time_or_now(Some(TimeOrNow::SpecificTime(time))),
            1_234_567_890
        );
        assert_eq!(system_time_from_ns(1_234_567_890), time);
    }

    #[test]
    fn attributes_map_onto_kernel_file_attrs() {
        let attrs = Attributes {
            mode: libc::S_IFLNK | 0o777,
            ino: 9,
            dev: 1,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 11,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            rdev: 0,
            blksize: 4096,
            blocks: 0,
        };

        let attr = file_attr(42, &attrs);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.perm, 0o777);
        assert_eq!(attr.size, 11);
    }
}
