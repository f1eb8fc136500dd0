//! The remote side of the mirrored file system.
//!
//! [`FsClient`] speaks the RPC dialect of [`super::LocalFs`];
//! [`RemoteFs`] plugs it into the kernel file system contract by forwarding
//! every operation verbatim. The caching layer wraps this type rather than
//! replacing it, so everything outside the cacheable prefixes behaves
//! identically with and without a cache.

use std::sync::Arc;

use serde_bytes::ByteBuf;

use super::{Attributes, FsService, StatVfs};
use crate::error::Result;
use crate::mnt::{MountCallback, Operations};
use crate::rpc::Client;

/// RPC client for the file system service.
#[derive(Debug)]
pub struct FsClient {
    client: Client,
}

impl FsClient {
    pub fn new(client: Client) -> Self {
        FsClient { client }
    }

    /// Check that the service is reachable, with a bounded wait.
    pub fn ping(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.client.ping(timeout)
    }
}

impl FsService for FsClient {
    fn open(&self, path: &str, flags: i32) -> Result<u64> {
        self.client.call("open", (path, flags))
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64> {
        self.client.call("create", (path, flags, mode))
    }

    fn read(&self, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>> {
        let data: ByteBuf = self.client.call("read", (fh, offset, size))?;
        Ok(data.into_vec())
    }

    fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u64> {
        self.client
            .call("write", (fh, offset, ByteBuf::from(data.to_vec())))
    }

    fn lseek(&self, fh: u64, offset: i64, whence: i32) -> Result<i64> {
        self.client.call("lseek", (fh, offset, whence))
    }

    fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        self.client.call("fsync", (fh, datasync))
    }

    fn flush(&self, fh: u64) -> Result<()> {
        self.client.call("flush", (fh,))
    }

    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()> {
        self.client.call("truncate", (path, fh, size))
    }

    fn release(&self, fh: u64) -> Result<()> {
        self.client.call("release", (fh,))
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.client.call("readdir", (path,))
    }

    fn readlink(&self, path: &str) -> Result<String> {
        self.client.call("readlink", (path,))
    }

    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes> {
        self.client.call("getattr", (path, fh))
    }

    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()> {
        self.client.call("chmod", (path, fh, mode))
    }

    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()> {
        self.client.call("chown", (path, fh, uid, gid))
    }

    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()> {
        self.client.call("utimens", (path, fh, atime_ns, mtime_ns))
    }

    fn link(&self, path: &str, target: &str) -> Result<()> {
        self.client.call("link", (path, target))
    }

    fn symlink(&self, path: &str, target: &str) -> Result<()> {
        self.client.call("symlink", (path, target))
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.client.call("mkdir", (path, mode))
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        self.client.call("mknod", (path, mode, rdev))
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.client.call("rename", (old, new))
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.client.call("unlink", (path,))
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.client.call("rmdir", (path,))
    }

    fn statfs(&self, path: &str) -> Result<StatVfs> {
        self.client.call("statfs", (path,))
    }
}

/// Network file system that forwards every kernel request to the local side.
pub struct RemoteFs {
    service: Arc<dyn FsService>,
    mount_callback: Option<MountCallback>,
}

impl RemoteFs {
    pub fn new(service: Arc<dyn FsService>, mount_callback: Option<MountCallback>) -> Self {
        RemoteFs {
            service,
            mount_callback,
        }
    }

}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs").finish_non_exhaustive()
    }
}

impl Operations for RemoteFs {
    fn init(&self) {
        if let Some(callback) = &self.mount_callback {
            callback();
        }
    }

    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes> {
        self.service.getattr(path, fh)
    }

    fn readlink(&self, path: &str) -> Result<String> {
        self.service.readlink(path)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.service.readdir(path)
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        self.service.mknod(path, mode, rdev)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.service.mkdir(path, mode)
    }

    fn symlink(&self, path: &str, target: &str) -> Result<()> {
        self.service.symlink(path, target)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.service.unlink(path)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.service.rmdir(path)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.service.rename(old, new)
    }

    fn link(&self, path: &str, target: &str) -> Result<()> {
        self.service.link(path, target)
    }

    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()> {
        self.service.chmod(path, fh, mode)
    }

    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()> {
        self.service.chown(path, fh, uid, gid)
    }

    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()> {
        self.service.truncate(path, fh, size)
    }

    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()> {
        self.service.utimens(path, fh, atime_ns, mtime_ns)
    }

    fn open(&self, path: &str, flags: i32) -> Result<u64> {
        self.service.open(path, flags)
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64> {
        self.service.create(path, flags, mode)
    }

    fn read(&self, _path: &str, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>> {
        self.service.read(fh, offset, size)
    }

    fn write(&self, _path: &str, fh: u64, offset: i64, data: &[u8]) -> Result<u64> {
        self.service.write(fh, offset, data)
    }

    fn statfs(&self, path: &str) -> Result<StatVfs> {
        self.service.statfs(path)
    }

    fn release(&self, _path: &str, fh: u64) -> Result<()> {
        self.service.release(fh)
    }

    fn flush(&self, _path: &str, fh: u64) -> Result<()> {
        self.service.flush(fh)
    }

    fn fsync(&self, _path: &str, fh: u64, datasync: bool) -> Result<()> {
        self.service.fsync(fh, datasync)
    }

    fn lseek(&self, _path: &str, fh: u64, offset: i64, whence: i32) -> Result<i64> {
        self.service.lseek(fh, offset, whence)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fs::LocalFs;
    use crate::rpc::Server;

    #[test]
    fn operations_round_trip_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"payload").unwrap();

        let server = Server::new(LocalFs::new(), "fs-token")
            .bind("127.0.0.1:0")
            .unwrap();
        let client = FsClient::new(Client::new(
            server.local_addr().to_string(),
            "fs-token",
            Some(Duration::from_secs(5)),
        ));

        client.ping(Some(Duration::from_secs(5))).unwrap();

        let path = file.to_str().unwrap();
        let attrs = client.getattr(path, None).unwrap();
        assert_eq!(attrs.size, 7);

        let fh = client.open(path, libc::O_RDONLY).unwrap();
        assert_eq!(client.read(fh, 0, 1024).unwrap(), b"payload");
        client.release(fh).unwrap();

        let err = client.getattr("/definitely/not/here", None).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
