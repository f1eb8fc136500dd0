//! The local side of the mirrored file system.
//!
//! [`LocalFs`] is a stateless passthrough: every operation maps one-to-one
//! to the kernel call, preferring descriptor variants when one is supplied
//! and falling back to "do not follow symlinks" path variants otherwise.
//! File handles are raw descriptor numbers; they are owned by the remote
//! side for the lifetime of an open file.

use std::ffi::CString;
use std::io;

use rmpv::Value;
use serde_bytes::ByteBuf;

use super::{Attributes, StatVfs, UTIME_NOW, UTIME_OMIT};
use crate::error::{Error, ErrorKind, RemoteError, Result};
use crate::rpc::{codec, unknown_method, Handler};

/// The operations the file system service exposes over RPC.
///
/// Implemented by [`LocalFs`] for direct (in-process) use and by
/// [`super::FsClient`] for calls across the transport, so the remote
/// adapters do not care which side of the wire they run on.
pub trait FsService: Send + Sync {
    fn open(&self, path: &str, flags: i32) -> Result<u64>;
    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64>;
    fn read(&self, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>>;
    fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u64>;
    fn lseek(&self, fh: u64, offset: i64, whence: i32) -> Result<i64>;
    fn fsync(&self, fh: u64, datasync: bool) -> Result<()>;
    fn flush(&self, fh: u64) -> Result<()>;
    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()>;
    fn release(&self, fh: u64) -> Result<()>;
    fn readdir(&self, path: &str) -> Result<Vec<String>>;
    fn readlink(&self, path: &str) -> Result<String>;
    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes>;
    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()>;
    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()>;
    fn link(&self, path: &str, target: &str) -> Result<()>;
    fn symlink(&self, path: &str, target: &str) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()>;
    fn rename(&self, old: &str, new: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn statfs(&self, path: &str) -> Result<StatVfs>;
}

/// Stateless POSIX passthrough on the originating machine.
#[derive(Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_ssize(ret: libc::ssize_t) -> io::Result<libc::ssize_t> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_off(ret: libc::off_t) -> io::Result<libc::off_t> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cstr(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| {
        Error::Remote(RemoteError::new(
            ErrorKind::InvalidArgument,
            "path contains a NUL byte",
        ))
    })
}

/// Positional read on a raw descriptor, shared with the cached-file path on
/// the remote side.
pub(crate) fn pread(fh: u64, offset: i64, size: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let n = cvt_ssize(unsafe {
        libc::pread(fh as libc::c_int, buf.as_mut_ptr().cast(), buf.len(), offset)
    })?;
    buf.truncate(n as usize);
    Ok(buf)
}

/// Close a raw descriptor, shared with the cached-file path on the remote side.
pub(crate) fn close(fh: u64) -> io::Result<()> {
    cvt(unsafe { libc::close(fh as libc::c_int) })?;
    Ok(())
}

/// `lstat` into an [`Attributes`] record, shared with the cache service.
pub(crate) fn lstat_attributes(path: &str) -> Result<Attributes> {
    let path = cstr(path)?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe { libc::lstat(path.as_ptr(), st.as_mut_ptr()) })?;
    Ok(Attributes::from_stat(unsafe { &st.assume_init() }))
}

fn fstat_attributes(fh: u64) -> Result<Attributes> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe { libc::fstat(fh as libc::c_int, st.as_mut_ptr()) })?;
    Ok(Attributes::from_stat(unsafe { &st.assume_init() }))
}

fn timespec_from_ns(ns: i64) -> libc::timespec {
    match ns {
        UTIME_NOW => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        UTIME_OMIT => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        ns => libc::timespec {
            tv_sec: ns.div_euclid(1_000_000_000),
            tv_nsec: ns.rem_euclid(1_000_000_000),
        },
    }
}

impl FsService for LocalFs {
    fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let path = cstr(path)?;
        let fd = cvt(unsafe { libc::open(path.as_ptr(), flags) })?;
        Ok(fd as u64)
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64> {
        let path = cstr(path)?;
        let fd = cvt(unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })?;
        Ok(fd as u64)
    }

    fn read(&self, fh: u64, offset: i64, size: u64) -> Result<Vec<u8>> {
        Ok(pread(fh, offset, size)?)
    }

    fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u64> {
        let n = cvt_ssize(unsafe {
            libc::pwrite(fh as libc::c_int, data.as_ptr().cast(), data.len(), offset)
        })?;
        Ok(n as u64)
    }

    fn lseek(&self, fh: u64, offset: i64, whence: i32) -> Result<i64> {
        Ok(cvt_off(unsafe { libc::lseek(fh as libc::c_int, offset, whence) })?)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        if datasync {
            cvt(unsafe { libc::fdatasync(fh as libc::c_int) })?;
        } else {
            cvt(unsafe { libc::fsync(fh as libc::c_int) })?;
        }
        Ok(())
    }

    fn flush(&self, fh: u64) -> Result<()> {
        // Emulate the side effects of a close without giving up the
        // descriptor: close a duplicate of it.
        let dup = cvt(unsafe { libc::dup(fh as libc::c_int) })?;
        cvt(unsafe { libc::close(dup) })?;
        Ok(())
    }

    fn truncate(&self, path: &str, fh: Option<u64>, size: i64) -> Result<()> {
        match fh {
            Some(fh) => cvt(unsafe { libc::ftruncate(fh as libc::c_int, size) })?,
            None => {
                let path = cstr(path)?;
                cvt(unsafe { libc::truncate(path.as_ptr(), size) })?
            }
        };
        Ok(())
    }

    fn release(&self, fh: u64) -> Result<()> {
        Ok(close(fh)?)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let mut names = vec![".".to_string(), "..".to_string()];

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|_| {
                Error::Remote(RemoteError::new(
                    ErrorKind::InvalidArgument,
                    "directory entry is not valid UTF-8",
                ))
            })?;
            names.push(name);
        }

        Ok(names)
    }

    fn readlink(&self, path: &str) -> Result<String> {
        let target = std::fs::read_link(path)?;
        target.into_os_string().into_string().map_err(|_| {
            Error::Remote(RemoteError::new(
                ErrorKind::InvalidArgument,
                "symlink target is not valid UTF-8",
            ))
        })
    }

    fn getattr(&self, path: &str, fh: Option<u64>) -> Result<Attributes> {
        match fh {
            Some(fh) => fstat_attributes(fh),
            None => lstat_attributes(path),
        }
    }

    fn chmod(&self, path: &str, fh: Option<u64>, mode: u32) -> Result<()> {
        match fh {
            Some(fh) => cvt(unsafe { libc::fchmod(fh as libc::c_int, mode) })?,
            None => {
                let path = cstr(path)?;
                cvt(unsafe { libc::chmod(path.as_ptr(), mode) })?
            }
        };
        Ok(())
    }

    fn chown(&self, path: &str, fh: Option<u64>, uid: u32, gid: u32) -> Result<()> {
        match fh {
            Some(fh) => cvt(unsafe { libc::fchown(fh as libc::c_int, uid, gid) })?,
            None => {
                let path = cstr(path)?;
                cvt(unsafe { libc::lchown(path.as_ptr(), uid, gid) })?
            }
        };
        Ok(())
    }

    fn utimens(&self, path: &str, fh: Option<u64>, atime_ns: i64, mtime_ns: i64) -> Result<()> {
        let times = [timespec_from_ns(atime_ns), timespec_from_ns(mtime_ns)];

        match fh {
            Some(fh) => cvt(unsafe { libc::futimens(fh as libc::c_int, times.as_ptr()) })?,
            None => {
                let path = cstr(path)?;
                cvt(unsafe {
                    libc::utimensat(
                        libc::AT_FDCWD,
                        path.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    )
                })?
            }
        };
        Ok(())
    }

    fn link(&self, path: &str, target: &str) -> Result<()> {
        let path = cstr(path)?;
        let target = cstr(target)?;
        cvt(unsafe { libc::link(target.as_ptr(), path.as_ptr()) })?;
        Ok(())
    }

    fn symlink(&self, path: &str, target: &str) -> Result<()> {
        let path = cstr(path)?;
        let target = cstr(target)?;
        cvt(unsafe { libc::symlink(target.as_ptr(), path.as_ptr()) })?;
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let path = cstr(path)?;
        cvt(unsafe { libc::mkdir(path.as_ptr(), mode) })?;
        Ok(())
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        let path = cstr(path)?;
        if mode & libc::S_IFMT == libc::S_IFIFO {
            cvt(unsafe { libc::mkfifo(path.as_ptr(), mode) })?;
        } else {
            cvt(unsafe { libc::mknod(path.as_ptr(), mode, rdev as libc::dev_t) })?;
        }
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = cstr(old)?;
        let new = cstr(new)?;
        cvt(unsafe { libc::rename(old.as_ptr(), new.as_ptr()) })?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let path = cstr(path)?;
        cvt(unsafe { libc::unlink(path.as_ptr()) })?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let path = cstr(path)?;
        cvt(unsafe { libc::rmdir(path.as_ptr()) })?;
        Ok(())
    }

    fn statfs(&self, path: &str) -> Result<StatVfs> {
        let path = cstr(path)?;
        let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
        cvt(unsafe { libc::statvfs(path.as_ptr(), st.as_mut_ptr()) })?;
        Ok(StatVfs::from_statvfs(unsafe { &st.assume_init() }))
    }
}

impl Handler for LocalFs {
    fn handle(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match method {
            "open" => {
                let (path, flags): (String, i32) = codec::args(args)?;
                codec::to_value(&self.open(&path, flags)?)
            }
            "create" => {
                let (path, flags, mode): (String, i32, u32) = codec::args(args)?;
                codec::to_value(&self.create(&path, flags, mode)?)
            }
            "read" => {
                let (fh, offset, size): (u64, i64, u64) = codec::args(args)?;
                codec::to_value(&ByteBuf::from(self.read(fh, offset, size)?))
            }
            "write" => {
                let (fh, offset, data): (u64, i64, ByteBuf) = codec::args(args)?;
                codec::to_value(&self.write(fh, offset, &data)?)
            }
            "lseek" => {
                let (fh, offset, whence): (u64, i64, i32) = codec::args(args)?;
                codec::to_value(&self.lseek(fh, offset, whence)?)
            }
            "fsync" => {
                let (fh, datasync): (u64, bool) = codec::args(args)?;
                codec::to_value(&self.fsync(fh, datasync)?)
            }
            "flush" => {
                let (fh,): (u64,) = codec::args(args)?;
                codec::to_value(&self.flush(fh)?)
            }
            "truncate" => {
                let (path, fh, size): (String, Option<u64>, i64) = codec::args(args)?;
                codec::to_value(&self.truncate(&path, fh, size)?)
            }
            "release" => {
                let (fh,): (u64,) = codec::args(args)?;
                codec::to_value(&self.release(fh)?)
            }
            "readdir" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.readdir(&path)?)
            }
            "readlink" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.readlink(&path)?)
            }
            "getattr" => {
                let (path, fh): (String, Option<u64>) = codec::args(args)?;
                codec::to_value(&self.getattr(&path, fh)?)
            }
            "chmod" => {
                let (path, fh, mode): (String, Option<u64>, u32) = codec::args(args)?;
                codec::to_value(&self.chmod(&path, fh, mode)?)
            }
            "chown" => {
                let (path, fh, uid, gid): (String, Option<u64>, u32, u32) = codec::args(args)?;
                codec::to_value(&self.chown(&path, fh, uid, gid)?)
            }
            "utimens" => {
                let (path, fh, atime_ns, mtime_ns): (String, Option<u64>, i64, i64) =
                    codec::args(args)?;
                codec::to_value(&self.utimens(&path, fh, atime_ns, mtime_ns)?)
            }
            "link" => {
                let (path, target): (String, String) = codec::args(args)?;
                codec::to_value(&self.link(&path, &target)?)
            }
            "symlink" => {
                let (path, target): (String, String) = codec::args(args)?;
                codec::to_value(&self.symlink(&path, &target)?)
            }
            "mkdir" => {
                let (path, mode): (String, u32) = codec::args(args)?;
                codec::to_value(&self.mkdir(&path, mode)?)
            }
            "mknod" => {
                let (path, mode, rdev): (String, u32, u64) = codec::args(args)?;
                codec::to_value(&self.mknod(&path, mode, rdev)?)
            }
            "rename" => {
                let (old, new): (String, String) = codec::args(args)?;
                codec::to_value(&self.rename(&old, &new)?)
            }
            "unlink" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.unlink(&path)?)
            }
            "rmdir" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.rmdir(&path)?)
            }
            "statfs" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.statfs(&path)?)
            }
            _ => Err(unknown_method(method)),
        }
    }
}
