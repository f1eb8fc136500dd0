//! Run commands on a remote machine against the local machine's file system.
//!
//! outrun mirrors the file system of the machine a command was launched from
//! onto the machine that executes it. The local side exposes plain POSIX
//! operations over a purpose-built RPC; the remote side mounts that RPC as a
//! FUSE file system and layers a persistent metadata/contents cache with
//! prefetching on top of it, so that running a program a second time costs a
//! handful of round trips instead of thousands.
//!
//! The crate is organized bottom-up:
//!
//! * [`rpc`] - framed MessagePack transport with a threaded server and a
//!   pooled client
//! * [`fs`] - the local file system service and the forwarding remote
//!   file system
//! * [`cache`] - the local bulk-I/O service, prefetch rules, and the remote
//!   cache engine
//! * [`mnt`] - the FUSE driver binding an [`mnt::Operations`] implementation
//!   to a mountpoint
//!
//! Process orchestration (SSH, chroot, service startup) lives outside this
//! crate; it hands the pieces here a connected endpoint, an authentication
//! token and a cache directory, and gets back a mounted file system.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod cache;
pub mod error;
pub mod fs;
pub mod handshake;
pub mod mnt;
pub mod rpc;

pub use crate::error::{Error, ErrorKind, RemoteError, Result};

/// Version of the wire protocol. The major version must match between the
/// local and remote side of a session.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Name the mounted file system reports to the kernel.
pub const FILESYSTEM_NAME: &str = "outrunfs";

/// Application id mixed into the machine identifier hash so that the raw
/// host id never leaves the local machine.
pub(crate) const APP_ID: &[u8] = b"0f7d3a5c96b14e8bb2c4d1a8e5f26709";
