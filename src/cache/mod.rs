//! Caching and prefetching for the mirrored file system.
//!
//! The network file system pays for every operation in round trips, and the
//! bulk of those operations hit directories that only ever change through
//! system updates: `/usr/lib`, `/usr/bin` and friends. This module treats
//! those directories as read-only for the duration of a session and keeps
//! their metadata and contents in a persistent cache on the remote machine.
//!
//! The design assumption throughout is that bandwidth is cheap and latency
//! is expensive. Contents are always transferred whole and compressed;
//! metadata freshness is checked with one bulk request at session start; and
//! the local side pushes data it expects the remote to need next (see
//! [`prefetch`]) instead of waiting to be asked.
//!
//! [`LocalCache`] is the service on the originating machine, [`RemoteCache`]
//! the engine next to the mount, and [`CachedFs`] the file system adapter
//! that routes cacheable paths through the engine.

pub mod engine;
pub mod fs;
pub mod key_lock;
pub mod local;
pub mod prefetch;

pub use engine::{CacheLimits, RemoteCache, DEFAULT_CACHEABLE_PATHS};
pub use fs::CachedFs;
pub use key_lock::KeyLocks;
pub use local::{CacheClient, CacheService, LocalCache};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, RemoteError, Result};
use crate::fs::Attributes;
use crate::rpc::codec::tagged_record;

tagged_record! {
    /// Everything needed to answer access-style calls for one path.
    ///
    /// Either `attr` (plus `link` for symlinks) or `error` is set: an I/O
    /// error is cached like any other answer, so repeated stats of a missing
    /// file cost nothing.
    pub struct Metadata : "Metadata" {
        pub attr: Option<Attributes>,
        pub link: Option<String>,
        pub error: Option<RemoteError>,
    }
}

impl Metadata {
    pub fn from_attributes(attr: Attributes, link: Option<String>) -> Self {
        Metadata {
            attr: Some(attr),
            link,
            error: None,
        }
    }

    pub fn from_error(error: RemoteError) -> Self {
        Metadata {
            attr: None,
            link: None,
            error: Some(error),
        }
    }

    /// The attributes, or the cached error re-raised.
    pub fn attributes(&self) -> Result<&Attributes> {
        if let Some(error) = &self.error {
            return Err(Error::Remote(error.clone()));
        }

        self.attr.as_ref().ok_or_else(|| {
            Error::Remote(RemoteError::new(
                ErrorKind::InvalidArgument,
                "metadata record is missing attributes",
            ))
        })
    }

    pub fn is_regular_file(&self) -> bool {
        self.attr.as_ref().is_some_and(Attributes::is_regular_file)
    }
}

/// Complete contents of one file, compressed for transfer.
///
/// LZ4 keeps the compression and decompression cost well below the latency
/// it saves. The checksum is over the uncompressed bytes and is what the
/// conditional re-read compares against.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContents {
    pub compressed_data: Vec<u8>,
    pub checksum: String,
    pub size: u64,
}

impl FileContents {
    pub(crate) const TYPE_NAME: &'static str = "FileContents";

    /// Compress and checksum raw file data.
    pub fn from_data(data: &[u8]) -> Self {
        FileContents {
            compressed_data: lz4_flex::compress_prepend_size(data),
            checksum: checksum(data),
            size: data.len() as u64,
        }
    }

    /// Decompress back to the original bytes.
    pub fn data(&self) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(&self.compressed_data)
            .map_err(|e| Error::Protocol(format!("corrupt file contents: {e}")))
    }
}

/// Checksum used for file contents everywhere in the cache.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Serialize)]
struct FileContentsFieldsRef<'a> {
    #[serde(with = "serde_bytes")]
    compressed_data: &'a [u8],
    checksum: &'a str,
    size: u64,
}

#[derive(Deserialize)]
struct FileContentsFields {
    #[serde(with = "serde_bytes")]
    compressed_data: Vec<u8>,
    checksum: String,
    size: u64,
}

#[derive(Serialize)]
struct FileContentsBodyRef<'a> {
    #[serde(rename = "type")]
    type_name: &'static str,
    data: FileContentsFieldsRef<'a>,
}

#[derive(Deserialize)]
struct FileContentsBody {
    #[serde(rename = "type")]
    type_name: String,
    data: FileContentsFields,
}

#[derive(Serialize)]
struct FileContentsEnvelopeRef<'a> {
    #[serde(rename = "__data__")]
    data: FileContentsBodyRef<'a>,
}

#[derive(Deserialize)]
struct FileContentsEnvelope {
    #[serde(rename = "__data__")]
    data: FileContentsBody,
}

impl Serialize for FileContents {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        FileContentsEnvelopeRef {
            data: FileContentsBodyRef {
                type_name: Self::TYPE_NAME,
                data: FileContentsFieldsRef {
                    compressed_data: &self.compressed_data,
                    checksum: &self.checksum,
                    size: self.size,
                },
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileContents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = FileContentsEnvelope::deserialize(deserializer)?;
        if envelope.data.type_name != Self::TYPE_NAME {
            return Err(<D::Error as serde::de::Error>::custom(format!(
                "unknown record '{}', expected '{}'",
                envelope.data.type_name,
                Self::TYPE_NAME,
            )));
        }

        let fields = envelope.data.data;
        Ok(FileContents {
            compressed_data: fields.compressed_data,
            checksum: fields.checksum,
            size: fields.size,
        })
    }
}

tagged_record! {
    /// A resolved prefetch pushed from the local to the remote side.
    pub struct PrefetchEntry : "PrefetchEntry" {
        pub path: String,
        pub metadata: Metadata,
        pub contents: Option<FileContents>,
    }
}

/// Whether `path` lies under `prefix` at a path component boundary.
pub(crate) fn path_within(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        // A bare "/" prefix covers every absolute path.
        return path.starts_with('/');
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
