//! The mirrored file system: records shared by both sides, the local
//! service that executes real I/O, and the remote side that forwards kernel
//! requests to it.
//!
//! The local machine is the single source of truth. The remote never caches
//! anything at this layer; all read-mostly optimizations live in
//! [`crate::cache`].

pub mod local;
pub mod remote;

pub use local::{FsService, LocalFs};
pub use remote::{FsClient, RemoteFs};

use crate::rpc::codec::tagged_record;

/// Nanosecond sentinel: set the timestamp to the current time.
pub const UTIME_NOW: i64 = i64::MAX;
/// Nanosecond sentinel: leave the timestamp unchanged.
pub const UTIME_OMIT: i64 = i64::MAX - 1;

tagged_record! {
    /// File system attributes, the answer to `stat`.
    ///
    /// Timestamps are nanoseconds since the epoch. `blksize`, `blocks` and
    /// `rdev` ride along opaquely for callers that want them; the cache
    /// freshness comparison treats them like any other field.
    pub struct Attributes : "Attributes" {
        pub mode: u32,
        pub ino: u64,
        pub dev: u64,
        pub nlink: u64,
        pub uid: u32,
        pub gid: u32,
        pub size: i64,
        pub atime_ns: i64,
        pub mtime_ns: i64,
        pub ctime_ns: i64,
        pub rdev: u64,
        pub blksize: i64,
        pub blocks: i64,
    }
}

impl Attributes {
    /// Capture the fields of a raw `stat` result.
    pub fn from_stat(st: &libc::stat) -> Self {
        Attributes {
            mode: st.st_mode,
            ino: st.st_ino,
            dev: st.st_dev,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size,
            atime_ns: st.st_atime * 1_000_000_000 + st.st_atime_nsec,
            mtime_ns: st.st_mtime * 1_000_000_000 + st.st_mtime_nsec,
            ctime_ns: st.st_ctime * 1_000_000_000 + st.st_ctime_nsec,
            rdev: st.st_rdev,
            blksize: st.st_blksize,
            blocks: st.st_blocks,
        }
    }

    /// Copy of the attributes with all write permission bits cleared.
    pub fn as_readonly(&self) -> Self {
        let mut attrs = self.clone();
        attrs.mode &= !(libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH);
        attrs
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_regular_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

tagged_record! {
    /// File system statistics, the answer to `statfs`.
    pub struct StatVfs : "StatVfs" {
        pub bsize: u64,
        pub frsize: u64,
        pub blocks: u64,
        pub bfree: u64,
        pub bavail: u64,
        pub files: u64,
        pub ffree: u64,
        pub favail: u64,
        pub flag: u64,
        pub namemax: u64,
    }
}

impl StatVfs {
    pub fn from_statvfs(st: &libc::statvfs) -> Self {
        StatVfs {
            bsize: st.f_bsize as u64,
            frsize: st.f_frsize as u64,
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            favail: st.f_favail as u64,
            flag: st.f_flag as u64,
            namemax: st.f_namemax as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Attributes {
        Attributes {
            mode: libc::S_IFREG | 0o644,
            ino: 7,
            dev: 1,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 42,
            atime_ns: 1,
            mtime_ns: 2,
            ctime_ns: 3,
            rdev: 0,
            blksize: 4096,
            blocks: 1,
        }
    }

    #[test]
    fn readonly_strips_all_write_bits() {
        let mut attrs = sample();
        attrs.mode = libc::S_IFREG | 0o777;

        let readonly = attrs.as_readonly();
        assert_eq!(readonly.mode, libc::S_IFREG | 0o555);
        // The original is untouched.
        assert_eq!(attrs.mode, libc::S_IFREG | 0o777);
    }

    #[test]
    fn file_type_predicates_follow_the_mode() {
        let mut attrs = sample();
        assert!(attrs.is_regular_file());
        assert!(!attrs.is_symlink());

        attrs.mode = libc::S_IFLNK | 0o777;
        assert!(attrs.is_symlink());

        attrs.mode = libc::S_IFDIR | 0o755;
        assert!(attrs.is_directory());
    }

    #[test]
    fn attributes_round_trip_through_the_codec() {
        let attrs = sample();
        let value = crate::rpc::codec::to_value(&attrs).unwrap();
        let back: Attributes = crate::rpc::codec::from_value(value).unwrap();
        assert_eq!(back, attrs);
    }
}
