//! File system adapter that serves cacheable paths from the cache engine.
//!
//! Every operation first checks whether its path falls under a cacheable
//! prefix. If not, the call is forwarded verbatim through the wrapped
//! [`RemoteFs`]. If it does, `getattr`/`readlink` are answered from cached
//! metadata and `open`/`read`/`release` operate on the local blob file.
//! Mutating operations always take the forwarding branch in practice
//! because the cacheable prefixes are read-mostly system directories, and
//! cached entries are presented read-only anyway.
//!
//! `readdir` is deliberately not cached: directory enumeration is rare in
//! this workload and caching it would complicate freshness for no gain.

use std::sync::Arc;

use log::error;

use super::engine::RemoteCache;
use crate::error::{Error, ErrorKind, RemoteError, Result};
use crate::fs::{Attributes, RemoteFs, StatVfs};
use crate::mnt::Operations;

/// [`RemoteFs`] with the cache engine layered over cacheable paths.
#[derive(Debug)]
pub struct CachedFs {
    inner: RemoteFs,
    cache: Arc<RemoteCache>,
}

impl CachedFs {
    pub fn new(inner: RemoteFs, cache: Arc<RemoteCache>) -> Self {
        CachedFs { inner, cache }
    }

    /// The engine backing this adapter.
    pub fn cache(&self) -> &Arc<RemoteCache> {
        &self.cache
    }
}

impl Operations for CachedFs {
    fn init(&self) {
        self.inner.init();
    }

    fn destroy(&self) {
        // Unmount must leave a persisted index behind. A failure here means
        // the cache directory itself is broken; the mount still goes down.
        if let Err(e) = self.cache.save(true) {
            error!("failed to save file system cache: {e}");
        }
    }

    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes> {
        if !self.cache.is_cacheable(path) {
            return self.inner.getattr(path, fh);
        }

        Ok(self
            .cache
            .get_metadata(path)?
            .attributes()?
            .clone())
    }

    fn readlink(&self, path: &str) -> Result<String> {
        if !self.cache.is_cacheable(path) {
            return self.inner.readlink(path);
        }

        self.cache.get_metadata(path)?.link.ok_or_else(|| {
            Error::Remote(RemoteError::new(
                ErrorKind::InvalidArgument,
                "not a symlink",
            ))
        })
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.inner.readdir(path)
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        self.inner.mknod(path, mode, rdev)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn symlink(&self, path: &str, target: &str) -> Result<()> {
        self.inner.symlink(path, target)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner.unlink(path)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.rmdir(path)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(old, new)
    }

    fn link(&self, path: &str, target: &str) -> Result<()> {
        self.inner.link(path, target)
    }

    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()> {
        self.inner.chmod(path, fh, mode)
    }

    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()> {
        self.inner.chown(path, fh, uid, gid)
    }

    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()> {
        self.inner.truncate(path, fh, size)
    }

    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()> {
        self.inner.utimens(path, fh, atime_ns, mtime_ns)
    }

    fn open(&self, path: &str, flags: i32) -> Result<u64> {
        if !self.cache.is_cacheable(path) {
            return self.inner.open(path, flags);
        }

        // Cached files can only ever be opened for reading; the stripped
        // write bits in their cached mode make the kernel reject the rest.
        self.cache.open_contents(path, flags)
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64> {
        self.inner.create(path, flags, mode)
    }

    fn read(&self, path: &str, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>> {
        if !self.cache.is_cacheable(path) {
            return self.inner.read(path, fh, offset, size);
        }

        Ok(crate::fs::local::pread(fh, offset, size)?)
    }

    fn write(&self, path: &str, fh: u64, offset: i64, data: &[u8]) -> Result<u64> {
        self.inner.write(path, fh, offset, data)
    }

    fn statfs(&self, path: &str) -> Result<StatVfs> {
        self.inner.statfs(path)
    }

    fn release(&self, path: &str, fh: u64) -> Result<()> {
        if !self.cache.is_cacheable(path) {
            return self.inner.release(path, fh);
        }

        Ok(crate::fs::local::close(fh)?)
    }

    fn flush(&self, path: &str, fh: u64) -> Result<()> {
        if !self.cache.is_cacheable(path) {
            return self.inner.flush(path, fh);
        }

        // FUSE flushes read-only files too; for a cached descriptor there is
        // nothing to write back.
        Ok(())
    }

    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> Result<()> {
        self.inner.fsync(path, fh, datasync)
    }

    fn lseek(&self, path: &str, fh: u64, offset: i64, whence: i32) -> Result<i64> {
        self.inner.lseek(path, fh, offset, whence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLimits, CacheService, LocalCache};
    use crate::fs::{FsService, LocalFs};

    struct Setup {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        fs: CachedFs,
    }

    impl Setup {
        /// Adapter over in-process services: `root` is the only cacheable
        /// prefix, so everything else exercises the forwarding branch.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();

            let service: Arc<dyn CacheService> = Arc::new(LocalCache::new());
            let cache = RemoteCache::new(
                root.join("cache"),
                "machine",
                service,
                false,
                CacheLimits::default(),
                vec![root.join("mirror").to_str().unwrap().to_string()],
            )
            .unwrap();

            let inner = RemoteFs::new(Arc::new(LocalFs::new()), None);
            let fs = CachedFs::new(inner, Arc::new(cache));

            std::fs::create_dir(root.join("mirror")).unwrap();
            Setup { _dir: dir, root, fs }
        }

        fn cacheable(&self, name: &str, data: &[u8]) -> String {
            let path = self.root.join("mirror").join(name);
            std::fs::write(&path, data).unwrap();
            path.to_str().unwrap().to_string()
        }

        fn uncacheable(&self, name: &str, data: &[u8]) -> String {
            let path = self.root.join(name);
            std::fs::write(&path, data).unwrap();
            path.to_str().unwrap().to_string()
        }
    }

    #[test]
    fn cacheable_attributes_lose_their_write_bits() {
        let setup = Setup::new();
        let path = setup.cacheable("file", b"x");

        let attrs = setup.fs.getattr(&path, None).unwrap();
        assert_eq!(attrs.mode & (libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH), 0);

        // Outside the cacheable set the real mode is visible.
        let path = setup.uncacheable("file", b"x");
        let attrs = setup.fs.getattr(&path, None).unwrap();
        assert_ne!(attrs.mode & libc::S_IWUSR, 0);
    }

    #[test]
    fn cacheable_reads_survive_local_changes() {
        let setup = Setup::new();
        let path = setup.cacheable("file", b"before");

        let fh = setup.fs.open(&path, libc::O_RDONLY).unwrap();
        assert_eq!(setup.fs.read(&path, fh, 0, 1024).unwrap(), b"before");
        setup.fs.flush(&path, fh).unwrap();
        setup.fs.release(&path, fh).unwrap();

        std::fs::write(&path, b"after").unwrap();

        let fh = setup.fs.open(&path, libc::O_RDONLY).unwrap();
        assert_eq!(setup.fs.read(&path, fh, 0, 1024).unwrap(), b"before");
        setup.fs.release(&path, fh).unwrap();

        // The forwarding branch sees the new contents immediately.
        let other = setup.uncacheable("other", b"after");
        let fh = setup.fs.open(&other, libc::O_RDONLY).unwrap();
        assert_eq!(setup.fs.read(&other, fh, 0, 1024).unwrap(), b"after");
        setup.fs.release(&other, fh).unwrap();
    }

    #[test]
    fn readlink_on_a_cached_non_symlink_is_invalid() {
        let setup = Setup::new();
        let path = setup.cacheable("file", b"x");

        let err = setup.fs.readlink(&path).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn readlink_serves_cached_targets() {
        let setup = Setup::new();
        let link = self_link(&setup);

        assert_eq!(setup.fs.readlink(&link).unwrap(), "/somewhere");
    }

    fn self_link(setup: &Setup) -> String {
        let link = setup.root.join("mirror").join("link");
        std::os::unix::fs::symlink("/somewhere", &link).unwrap();
        link.to_str().unwrap().to_string()
    }

    #[test]
    fn writes_are_always_forwarded() {
        let setup = Setup::new();
        let path = setup.uncacheable("file", b"");

        let fh = setup.fs.open(&path, libc::O_WRONLY).unwrap();
        assert_eq!(setup.fs.write(&path, fh, 0, b"data").unwrap(), 4);
        setup.fs.release(&path, fh).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn destroy_persists_the_cache_index() {
        let setup = Setup::new();
        let path = setup.cacheable("file", b"x");
        setup.fs.getattr(&path, None).unwrap();

        setup.fs.destroy();

        assert!(setup.root.join("cache").join("index.json").exists());
    }
}
