//! The cache service on the originating machine.
//!
//! Bulk operations that exist purely to save round trips: metadata with the
//! symlink target folded in, whole-file reads, conditional re-reads, a bulk
//! freshness check, and the prefetch resolver that turns rule suggestions
//! into pushed [`PrefetchEntry`] records.
//!
//! The service remembers which paths already had metadata or contents
//! fetched this session, so prefetching never resends what the remote
//! already holds. The remote seeds the contents set after its own cache
//! sync via [`CacheService::mark_previously_fetched_contents`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::warn;
use parking_lot::Mutex;
use rmpv::Value;
use sha2::{Digest, Sha256};

use super::prefetch::{self, PrefetchSuggestion};
use super::{path_within, FileContents, Metadata, PrefetchEntry};
use crate::error::{RemoteError, Result};
use crate::fs::local::lstat_attributes;
use crate::rpc::{codec, unknown_method, Client, Handler};

/// The operations the cache service exposes over RPC.
///
/// Implemented by [`LocalCache`] for direct use (and tests) and by
/// [`CacheClient`] across the transport.
pub trait CacheService: Send + Sync {
    /// Metadata for one path; I/O errors are captured inside the record.
    fn get_metadata(&self, path: &str) -> Result<Metadata>;

    /// Re-read the given paths and return only significantly changed records.
    fn get_changed_metadata(
        &self,
        cached: HashMap<String, Metadata>,
    ) -> Result<HashMap<String, Metadata>>;

    /// Read a whole file.
    fn readfile(&self, path: &str) -> Result<FileContents>;

    /// Read a whole file only if its checksum differs from `checksum`.
    fn readfile_conditional(&self, path: &str, checksum: &str) -> Result<Option<FileContents>>;

    /// Metadata plus access-rule prefetches.
    fn get_metadata_prefetch(&self, path: &str) -> Result<(Metadata, Vec<PrefetchEntry>)>;

    /// Contents plus read-rule prefetches.
    fn readfile_prefetch(&self, path: &str) -> Result<(FileContents, Vec<PrefetchEntry>)>;

    /// The remote already holds contents for these paths; do not push them.
    fn mark_previously_fetched_contents(&self, paths: Vec<String>) -> Result<()>;

    /// Restrict prefetch output to these prefixes; `None` lifts the filter.
    fn set_prefetchable_paths(&self, paths: Option<Vec<String>>) -> Result<()>;

    /// Stable per-host identifier, safe to use in shared cache keys.
    fn get_app_specific_machine_id(&self) -> Result<String>;
}

#[derive(Debug, Default)]
struct Fetched {
    metadata: HashSet<String>,
    contents: HashSet<String>,
}

/// Cache service implementation backed by the local file system.
#[derive(Debug)]
pub struct LocalCache {
    fetched: Mutex<Fetched>,
    prefetchable_paths: Mutex<Option<Vec<String>>>,
    machine_id_path: PathBuf,
}

impl Default for LocalCache {
    fn default() -> Self {
        LocalCache {
            fetched: Mutex::new(Fetched::default()),
            prefetchable_paths: Mutex::new(None),
            machine_id_path: PathBuf::from("/etc/machine-id"),
        }
    }
}

impl LocalCache {
    pub fn new() -> Self {
        LocalCache::default()
    }

    #[cfg(test)]
    pub(crate) fn with_machine_id_path(path: impl Into<PathBuf>) -> Self {
        LocalCache {
            machine_id_path: path.into(),
            ..LocalCache::default()
        }
    }

    fn read_metadata(path: &str) -> Metadata {
        match lstat_attributes(path) {
            Ok(attr) => {
                let link = if attr.is_symlink() {
                    std::fs::read_link(path)
                        .ok()
                        .and_then(|t| t.into_os_string().into_string().ok())
                } else {
                    None
                };
                Metadata::from_attributes(attr, link)
            }
            Err(e) => Metadata::from_error(e.to_remote()),
        }
    }

    fn is_prefetchable(&self, path: &str) -> bool {
        match &*self.prefetchable_paths.lock() {
            None => true,
            Some(prefixes) => prefixes.iter().any(|prefix| path_within(path, prefix)),
        }
    }

    /// Turn rule suggestions into resolved prefetch entries.
    ///
    /// Suggestions are deduplicated by path with their contents flags OR-ed
    /// together, filtered against the prefetchable prefixes and the
    /// already-fetched sets, and then resolved. Contents are best-effort: a
    /// failed read keeps the metadata-only entry.
    fn resolve_prefetches(&self, suggestions: Vec<PrefetchSuggestion>) -> Vec<PrefetchEntry> {
        let mut order: Vec<String> = Vec::new();
        let mut wants_contents: HashMap<String, bool> = HashMap::new();

        for suggestion in suggestions {
            match wants_contents.get_mut(&suggestion.path) {
                Some(contents) => *contents |= suggestion.contents,
                None => {
                    order.push(suggestion.path.clone());
                    wants_contents.insert(suggestion.path, suggestion.contents);
                }
            }
        }

        let mut entries = Vec::new();

        for path in order {
            let contents_wanted = wants_contents[&path];

            if !self.is_prefetchable(&path) {
                continue;
            }

            {
                let fetched = self.fetched.lock();
                if contents_wanted && fetched.contents.contains(&path) {
                    continue;
                }
                if !contents_wanted && fetched.metadata.contains(&path) {
                    continue;
                }
            }

            let metadata = match self.get_metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            let mut entry = PrefetchEntry {
                path: path.clone(),
                metadata,
                contents: None,
            };

            if contents_wanted && entry.metadata.error.is_none() && entry.metadata.is_regular_file()
            {
                match self.readfile(&path) {
                    Ok(contents) => entry.contents = Some(contents),
                    Err(e) => warn!("failed to prefetch contents of {path}: {e}"),
                }
            }

            entries.push(entry);
        }

        entries
    }
}

/// Fields whose change is worth pushing to the remote cache.
///
/// Access time is excluded: it changes on every read and means nothing for
/// cache validity. Errors compare by kind and arguments, symlink targets by
/// value. All other [`crate::fs::Attributes`] fields participate.
fn significant_eq(a: &Metadata, b: &Metadata) -> bool {
    let strip_atime = |meta: &Metadata| {
        meta.attr.as_ref().map(|attr| {
            let mut attr = attr.clone();
            attr.atime_ns = 0;
            attr
        })
    };

    let errors_match = match (&a.error, &b.error) {
        (None, None) => true,
        (Some(ea), Some(eb)) => ea.same_failure(eb),
        _ => false,
    };

    strip_atime(a) == strip_atime(b) && errors_match && a.link == b.link
}

impl CacheService for LocalCache {
    fn get_metadata(&self, path: &str) -> Result<Metadata> {
        let metadata = Self::read_metadata(path);
        self.fetched.lock().metadata.insert(path.to_string());
        Ok(metadata)
    }

    fn get_changed_metadata(
        &self,
        cached: HashMap<String, Metadata>,
    ) -> Result<HashMap<String, Metadata>> {
        let mut changed = HashMap::new();

        for (path, metadata) in cached {
            let current = self.get_metadata(&path)?;
            if !significant_eq(&current, &metadata) {
                changed.insert(path, current);
            }
        }

        Ok(changed)
    }

    fn readfile(&self, path: &str) -> Result<FileContents> {
        let data = std::fs::read(path)?;
        self.fetched.lock().contents.insert(path.to_string());
        Ok(FileContents::from_data(&data))
    }

    fn readfile_conditional(&self, path: &str, checksum: &str) -> Result<Option<FileContents>> {
        let contents = self.readfile(path)?;

        if contents.checksum != checksum {
            Ok(Some(contents))
        } else {
            Ok(None)
        }
    }

    fn get_metadata_prefetch(&self, path: &str) -> Result<(Metadata, Vec<PrefetchEntry>)> {
        let base = self.get_metadata(path)?;
        let prefetches = self.resolve_prefetches(prefetch::file_access(path));
        Ok((base, prefetches))
    }

    fn readfile_prefetch(&self, path: &str) -> Result<(FileContents, Vec<PrefetchEntry>)> {
        let base = self.readfile(path)?;
        let prefetches = self.resolve_prefetches(prefetch::file_read(path));
        Ok((base, prefetches))
    }

    fn mark_previously_fetched_contents(&self, paths: Vec<String>) -> Result<()> {
        self.fetched.lock().contents.extend(paths);
        Ok(())
    }

    fn set_prefetchable_paths(&self, paths: Option<Vec<String>>) -> Result<()> {
        *self.prefetchable_paths.lock() = paths;
        Ok(())
    }

    fn get_app_specific_machine_id(&self) -> Result<String> {
        let raw = std::fs::read(&self.machine_id_path)?;
        let raw = raw.trim_ascii();

        // One-way derivation: the persistent host id is confidential and
        // must not be recoverable from cache directories it ends up in.
        let mut hasher = Sha256::new();
        hasher.update(raw);
        hasher.update(crate::APP_ID);

        Ok(hex::encode(hasher.finalize())[..32].to_string())
    }
}

impl Handler for LocalCache {
    fn handle(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match method {
            "get_metadata" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.get_metadata(&path)?)
            }
            "get_changed_metadata" => {
                let (cached,): (HashMap<String, Metadata>,) = codec::args(args)?;
                codec::to_value(&self.get_changed_metadata(cached)?)
            }
            "readfile" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.readfile(&path)?)
            }
            "readfile_conditional" => {
                let (path, checksum): (String, String) = codec::args(args)?;
                codec::to_value(&self.readfile_conditional(&path, &checksum)?)
            }
            "get_metadata_prefetch" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.get_metadata_prefetch(&path)?)
            }
            "readfile_prefetch" => {
                let (path,): (String,) = codec::args(args)?;
                codec::to_value(&self.readfile_prefetch(&path)?)
            }
            "mark_previously_fetched_contents" => {
                let (paths,): (Vec<String>,) = codec::args(args)?;
                codec::to_value(&self.mark_previously_fetched_contents(paths)?)
            }
            "set_prefetchable_paths" => {
                let (paths,): (Option<Vec<String>>,) = codec::args(args)?;
                codec::to_value(&self.set_prefetchable_paths(paths)?)
            }
            "get_app_specific_machine_id" => {
                codec::to_value(&self.get_app_specific_machine_id()?)
            }
            _ => Err(unknown_method(method)),
        }
    }
}

/// RPC client for the cache service.
#[derive(Debug)]
pub struct CacheClient {
    client: Client,
}

impl CacheClient {
    pub fn new(client: Client) -> Self {
        CacheClient { client }
    }

    /// Check that the service is reachable, with a bounded wait.
    pub fn ping(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.client.ping(timeout)
    }
}

impl CacheService for CacheClient {
    fn get_metadata(&self, path: &str) -> Result<Metadata> {
        self.client.call("get_metadata", (path,))
    }

    fn get_changed_metadata(
        &self,
        cached: HashMap<String, Metadata>,
    ) -> Result<HashMap<String, Metadata>> {
        self.client.call("get_changed_metadata", (cached,))
    }

    fn readfile(&self, path: &str) -> Result<FileContents> {
        self.client.call("readfile", (path,))
    }

    fn readfile_conditional(&self, path: &str, checksum: &str) -> Result<Option<FileContents>> {
        self.client.call("readfile_conditional", (path, checksum))
    }

    fn get_metadata_prefetch(&self, path: &str) -> Result<(Metadata, Vec<PrefetchEntry>)> {
        self.client.call("get_metadata_prefetch", (path,))
    }

    fn readfile_prefetch(&self, path: &str) -> Result<(FileContents, Vec<PrefetchEntry>)> {
        self.client.call("readfile_prefetch", (path,))
    }

    fn mark_previously_fetched_contents(&self, paths: Vec<String>) -> Result<()> {
        self.client.call("mark_previously_fetched_contents", (paths,))
    }

    fn set_prefetchable_paths(&self, paths: Option<Vec<String>>) -> Result<()> {
        self.client.call("set_prefetchable_paths", (paths,))
    }

    fn get_app_specific_machine_id(&self) -> Result<String> {
        self.client.call("get_app_specific_machine_id", ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_str(path: &std::path::Path) -> String {
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn metadata_captures_errors_instead_of_failing() {
        let cache = LocalCache::new();
        let meta = cache.get_metadata("/definitely/not/here").unwrap();

        assert!(meta.attr.is_none());
        assert_eq!(meta.error.unwrap().errno(), libc::ENOENT);
    }

    #[test]
    fn metadata_includes_symlink_targets() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/somewhere", &link).unwrap();

        let cache = LocalCache::new();
        let meta = cache.get_metadata(&path_str(&link)).unwrap();

        assert!(meta.attr.unwrap().is_symlink());
        assert_eq!(meta.link.as_deref(), Some("/somewhere"));
    }

    #[test]
    fn significance_ignores_access_time_but_not_size_or_links() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"abc").unwrap();

        let cache = LocalCache::new();
        let base = cache.get_metadata(&path_str(&file)).unwrap();

        let mut atime_only = base.clone();
        atime_only.attr.as_mut().unwrap().atime_ns += 5_000_000_000;
        assert!(significant_eq(&base, &atime_only));

        let mut grown = base.clone();
        grown.attr.as_mut().unwrap().size += 1;
        assert!(!significant_eq(&base, &grown));

        let mut relinked = base.clone();
        relinked.link = Some("/elsewhere".to_string());
        assert!(!significant_eq(&base, &relinked));
    }

    #[test]
    fn changed_metadata_reports_real_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"abc").unwrap();
        let path = path_str(&file);

        let cache = LocalCache::new();
        let before = cache.get_metadata(&path).unwrap();

        let cached = HashMap::from([(path.clone(), before.clone())]);
        assert!(cache.get_changed_metadata(cached).unwrap().is_empty());

        std::fs::write(&file, b"abcdef").unwrap();

        let cached = HashMap::from([(path.clone(), before)]);
        let changed = cache.get_changed_metadata(cached).unwrap();
        assert!(changed.contains_key(&path));
    }

    #[test]
    fn changed_metadata_compares_errors_by_failure() {
        let cache = LocalCache::new();
        let missing = "/definitely/not/here".to_string();

        let before = cache.get_metadata(&missing).unwrap();
        let cached = HashMap::from([(missing, before)]);
        assert!(cache.get_changed_metadata(cached).unwrap().is_empty());
    }

    #[test]
    fn conditional_read_skips_unchanged_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"v1").unwrap();
        let path = path_str(&file);

        let cache = LocalCache::new();
        let contents = cache.readfile(&path).unwrap();

        assert!(cache
            .readfile_conditional(&path, &contents.checksum)
            .unwrap()
            .is_none());

        std::fs::write(&file, b"v2").unwrap();
        let fresh = cache
            .readfile_conditional(&path, &contents.checksum)
            .unwrap()
            .unwrap();
        assert_eq!(fresh.data().unwrap(), b"v2");
    }

    #[test]
    fn machine_id_is_derived_not_raw() {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join("machine-id");
        std::fs::write(&id_file, "5f9c6b2a31d84a7e9d3b1c2a4e5f6a7b\n").unwrap();

        let cache = LocalCache::with_machine_id_path(&id_file);
        let id_a = cache.get_app_specific_machine_id().unwrap();
        let id_b = cache.get_app_specific_machine_id().unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(id_a.len(), 32);
        assert!(id_a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id_a, "5f9c6b2a31d84a7e9d3b1c2a4e5f6a7b");
    }

    #[test]
    fn prefetch_resolution_dedups_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.so");
        std::fs::write(&file, b"bytes").unwrap();
        let path = path_str(&file);

        let cache = LocalCache::new();
        let entries = cache.resolve_prefetches(vec![
            PrefetchSuggestion {
                path: path.clone(),
                contents: false,
            },
            PrefetchSuggestion {
                path: path.clone(),
                contents: true,
            },
        ]);

        // One entry, with contents because one suggestion asked for them.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, path);
        assert!(entries[0].contents.is_some());
    }

    #[test]
    fn prefetch_respects_the_prefetchable_filter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.so");
        std::fs::write(&file, b"bytes").unwrap();

        let cache = LocalCache::new();
        cache
            .set_prefetchable_paths(Some(vec!["/nonexistent-prefix".to_string()]))
            .unwrap();

        let entries = cache.resolve_prefetches(vec![PrefetchSuggestion {
            path: path_str(&file),
            contents: true,
        }]);
        assert!(entries.is_empty());
    }

    #[test]
    fn prefetch_skips_already_fetched_data() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.so");
        std::fs::write(&file, b"bytes").unwrap();
        let path = path_str(&file);

        let cache = LocalCache::new();
        cache.readfile(&path).unwrap();

        let entries = cache.resolve_prefetches(vec![PrefetchSuggestion {
            path: path.clone(),
            contents: true,
        }]);
        assert!(entries.is_empty());

        // Metadata-only suggestions are tracked separately.
        let entries = cache.resolve_prefetches(vec![PrefetchSuggestion {
            path: path.clone(),
            contents: false,
        }]);
        assert!(entries.is_empty() || entries[0].contents.is_none());
    }

    #[test]
    fn prefetch_keeps_metadata_when_contents_fail() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("sub");
        std::fs::create_dir(&subdir).unwrap();

        let cache = LocalCache::new();
        let entries = cache.resolve_prefetches(vec![PrefetchSuggestion {
            path: path_str(&subdir),
            contents: true,
        }]);

        // A directory has no contents to read; the metadata entry survives.
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contents.is_none());
        assert!(entries[0].metadata.attr.is_some());
    }
}
