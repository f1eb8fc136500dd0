//! The cache engine on the remote machine.
//!
//! Entries are keyed by `"<machine-id>:<absolute-path>"`, so caches from
//! different originating hosts coexist in one directory. Each entry holds
//! the last known metadata and, for regular files that were opened, a blob
//! file with the uncompressed contents on the remote disk.
//!
//! Freshness works in bulk: at session start [`RemoteCache::sync`] sends all
//! cached metadata for the current machine to the local side and applies
//! only what changed, marking affected contents dirty so the next open
//! re-verifies the checksum. During the session files under the cacheable
//! prefixes are assumed not to change and are served read-only.
//!
//! At session end [`RemoteCache::save`] merges with whatever another session
//! wrote to the index in the meantime (most recent `last_update` wins),
//! evicts by least recent access down to the configured limits, garbage
//! collects unreferenced blobs and atomically installs the new index. The
//! index file is JSON in the same tagged encoding the RPC uses; an advisory
//! lock file serializes index access across processes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use super::key_lock::KeyLocks;
use super::local::CacheService;
use super::{path_within, FileContents, Metadata, PrefetchEntry};
use crate::error::{Error, Result};
use crate::rpc::codec::tagged_record;

/// Directories that are cacheable by default: common dependency locations
/// that only change through system updates.
pub const DEFAULT_CACHEABLE_PATHS: &[&str] = &[
    "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc", "/opt", "/usr",
];

/// Budgets enforced by the LRU pass at save time.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Maximum number of cache entries kept in the index.
    pub max_entries: usize,
    /// Maximum total bytes of cached contents on disk.
    pub max_size: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            max_entries: 1024,
            max_size: 20 * 1024 * 1024 * 1024,
        }
    }
}

tagged_record! {
    /// Where an entry's cached contents live on the remote disk.
    ///
    /// `dirty` means the metadata changed since the blob was written; the
    /// checksum must be re-verified against the local side before the blob
    /// is served again.
    pub struct ContentsBlob : "ContentsBlob" {
        pub storage: String,
        pub size: u64,
        pub checksum: String,
        pub dirty: bool,
    }
}

tagged_record! {
    /// One cached path on one originating machine.
    ///
    /// `last_access` drives LRU eviction and is refreshed on every lookup;
    /// `last_update` is refreshed whenever metadata or contents change and
    /// resolves conflicts when two sessions merge their indexes.
    pub struct CacheEntry : "CacheEntry" {
        pub path: String,
        pub meta: Metadata,
        pub last_access: f64,
        pub last_update: f64,
        pub contents: Option<ContentsBlob>,
    }
}

impl CacheEntry {
    fn new(path: impl Into<String>, meta: Metadata) -> Self {
        let now = now();
        CacheEntry {
            path: path.into(),
            meta,
            last_access: now,
            last_update: now,
            contents: None,
        }
    }

    /// Whether this entry should win a merge against `other`.
    pub fn newer_than(&self, other: Option<&CacheEntry>) -> bool {
        match other {
            None => true,
            Some(other) => self.last_update > other.last_update,
        }
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Cache and prefetch engine for one local machine's mirrored file system.
pub struct RemoteCache {
    base_path: PathBuf,
    machine_id: String,
    client: Arc<dyn CacheService>,
    prefetch: bool,
    limits: CacheLimits,
    cacheable_paths: Vec<String>,

    entries: Mutex<HashMap<String, CacheEntry>>,
    entry_locks: KeyLocks,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("base_path", &self.base_path)
            .field("machine_id", &self.machine_id)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl RemoteCache {
    /// Set up the engine over a cache directory, creating it as needed.
    ///
    /// The cacheable prefixes are also installed as the local side's
    /// prefetchable paths, so prefetching can never push data the engine
    /// would refuse to store.
    pub fn new(
        base_path: impl Into<PathBuf>,
        machine_id: impl Into<String>,
        client: Arc<dyn CacheService>,
        prefetch: bool,
        limits: CacheLimits,
        cacheable_paths: Vec<String>,
    ) -> Result<Self> {
        let cache = RemoteCache {
            base_path: base_path.into(),
            machine_id: machine_id.into(),
            client,
            prefetch,
            limits,
            cacheable_paths,
            entries: Mutex::new(HashMap::new()),
            entry_locks: KeyLocks::new(),
        };

        std::fs::create_dir_all(cache.contents_dir())?;
        cache
            .client
            .set_prefetchable_paths(Some(cache.cacheable_paths.clone()))?;

        Ok(cache)
    }

    /// Number of cached entries.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Total bytes of cached contents.
    pub fn size(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .filter_map(|e| e.contents.as_ref())
            .map(|b| b.size)
            .sum()
    }

    /// Whether the path falls under one of the cacheable prefixes.
    pub fn is_cacheable(&self, path: &str) -> bool {
        self.cacheable_paths
            .iter()
            .any(|prefix| path_within(path, prefix))
    }

    /// Cached metadata for a path, with write permissions stripped.
    ///
    /// A cached I/O error is re-raised exactly as the local side saw it.
    pub fn get_metadata(&self, path: &str) -> Result<Metadata> {
        self.with_entry(path, |entry| {
            let attr = entry.meta.attributes()?.as_readonly();
            Ok(Metadata {
                attr: Some(attr),
                link: entry.meta.link.clone(),
                error: None,
            })
        })
    }

    /// Open a descriptor onto the cached contents of a file.
    ///
    /// Refreshes the blob first when it is missing or dirty. A blob file
    /// that disappeared from disk between sessions triggers one forced
    /// refresh; a second failure is surfaced.
    pub fn open_contents(&self, path: &str, flags: i32) -> Result<u64> {
        self.with_entry(path, |entry| {
            let needs_refresh = entry.contents.as_ref().map_or(true, |blob| blob.dirty);
            if needs_refresh {
                entry.contents = Some(self.update_contents(entry, false)?);
                entry.last_update = now();
            }

            let storage = match &entry.contents {
                Some(blob) => blob.storage.clone(),
                None => return Err(Error::Protocol("entry has no cached contents".to_string())),
            };

            match open_blob(&storage, flags) {
                Ok(fd) => Ok(fd),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    entry.contents = Some(self.update_contents(entry, true)?);
                    entry.last_update = now();

                    let storage = match &entry.contents {
                        Some(blob) => blob.storage.clone(),
                        None => {
                            return Err(Error::Protocol(
                                "entry has no cached contents".to_string(),
                            ))
                        }
                    };
                    Ok(open_blob(&storage, flags)?)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Initialize the in-memory cache from the on-disk index.
    pub fn load(&self) -> Result<()> {
        let _index_lock = self.lock_index()?;

        let entries = match self.read_disk_entries() {
            Ok(entries) => entries,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                // A corrupt index is not worth failing the session over.
                error!("discarding unreadable cache index: {e}");
                HashMap::new()
            }
        };

        *self.entries.lock() = entries;
        Ok(())
    }

    /// Reconcile cached metadata with the local machine's current state.
    ///
    /// Sends every cached metadata record for this machine in one request
    /// and applies only the significant changes. Contents belonging to
    /// changed entries are dropped (no longer a regular file, or now an
    /// error) or marked dirty for checksum re-verification. Finally the
    /// local side learns which contents the cache already holds cleanly, so
    /// prefetching does not resend them.
    pub fn sync(&self) -> Result<()> {
        let machine_prefix = format!("{}:", self.machine_id);

        let cached: HashMap<String, Metadata> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(&machine_prefix))
            .map(|(_, entry)| (entry.path.clone(), entry.meta.clone()))
            .collect();

        if cached.is_empty() {
            return Ok(());
        }

        let changed = self.client.get_changed_metadata(cached)?;

        for (path, new_meta) in changed {
            debug!("updating metadata cache for {path}");

            self.with_entry(&path, |entry| {
                entry.meta = new_meta.clone();
                entry.last_update = now();

                if entry.contents.is_some() {
                    if entry.meta.error.is_some() || !entry.meta.is_regular_file() {
                        entry.contents = None;
                    } else if let Some(blob) = &mut entry.contents {
                        blob.dirty = true;
                    }
                }

                Ok(())
            })?;
        }

        if self.prefetch {
            let clean: Vec<String> = self
                .entries
                .lock()
                .values()
                .filter(|e| e.contents.as_ref().is_some_and(|b| !b.dirty))
                .map(|e| e.path.clone())
                .collect();

            self.client.mark_previously_fetched_contents(clean)?;
        }

        Ok(())
    }

    /// Persist the in-memory cache to the on-disk index.
    ///
    /// With `merge_disk_cache` the index is re-read first and entries
    /// another session wrote in the meantime are merged in, most recent
    /// `last_update` winning. The LRU pass and blob garbage collection run
    /// on the merged view before it is written out.
    pub fn save(&self, merge_disk_cache: bool) -> Result<()> {
        let _index_lock = self.lock_index()?;
        let mut entries = self.entries.lock();

        if merge_disk_cache {
            match self.read_disk_entries() {
                Ok(disk_entries) => {
                    for (key, disk_entry) in disk_entries {
                        if disk_entry.newer_than(entries.get(&key)) {
                            entries.insert(key, disk_entry);
                        }
                    }
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("no disk cache to merge with");
                }
                Err(e) => {
                    error!("not merging with existing disk cache: {e}");
                }
            }
        }

        lru_cleanup(&mut entries, self.limits);
        self.collect_orphan_blobs(&entries);

        let temp_path = self.index_path().with_extension("tmp");
        let file = File::create(&temp_path)?;
        serde_json::to_writer(BufWriter::new(file), &*entries)
            .map_err(|e| Error::Protocol(format!("failed to encode cache index: {e}")))?;
        std::fs::rename(&temp_path, self.index_path())?;

        Ok(())
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join("index.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.base_path.join("index.lock")
    }

    fn contents_dir(&self) -> PathBuf {
        self.base_path.join("contents")
    }

    fn entry_key(&self, path: &str) -> String {
        format!("{}:{}", self.machine_id, path)
    }

    fn lock_index(&self) -> Result<IndexLock> {
        IndexLock::acquire(&self.lock_path())
    }

    fn read_disk_entries(&self) -> Result<HashMap<String, CacheEntry>> {
        let file = File::open(self.index_path())?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Protocol(format!("failed to decode cache index: {e}")))
    }

    /// Run `f` with exclusive access to the path's entry, creating the entry
    /// (and storing any accompanying prefetches) on first access.
    fn with_entry<R>(&self, path: &str, f: impl FnOnce(&mut CacheEntry) -> Result<R>) -> Result<R> {
        let key = self.entry_key(path);
        let _guard = self.entry_locks.lock(&key);

        let existing = self.entries.lock().get(&key).cloned();
        let mut entry = match existing {
            Some(mut entry) => {
                entry.last_access = now();
                entry
            }
            None => {
                let (meta, prefetches) = if self.prefetch {
                    self.client.get_metadata_prefetch(path)?
                } else {
                    (self.client.get_metadata(path)?, Vec::new())
                };

                let entry = CacheEntry::new(path, meta);
                self.entries.lock().insert(key.clone(), entry.clone());

                if !prefetches.is_empty() {
                    self.store_prefetches(path, prefetches);
                    // A prefetch for the triggering path itself may have
                    // already filled in contents.
                    let stored = self.entries.lock().get(&key).cloned();
                    if let Some(stored) = stored {
                        return self.finish_entry(&key, stored, f);
                    }
                }

                entry
            }
        };

        let result = f(&mut entry);
        self.entries.lock().insert(key, entry);
        result
    }

    fn finish_entry<R>(
        &self,
        key: &str,
        mut entry: CacheEntry,
        f: impl FnOnce(&mut CacheEntry) -> Result<R>,
    ) -> Result<R> {
        let result = f(&mut entry);
        self.entries.lock().insert(key.to_string(), entry);
        result
    }

    /// Fetch fresh contents for an entry and write them to a new blob.
    ///
    /// Without `force`, an existing blob is revalidated by checksum first;
    /// if the local side reports no change the blob is kept and merely
    /// marked clean.
    fn update_contents(&self, entry: &CacheEntry, force: bool) -> Result<ContentsBlob> {
        if !force {
            if let Some(blob) = &entry.contents {
                return match self.client.readfile_conditional(&entry.path, &blob.checksum)? {
                    Some(contents) => self.save_contents(&contents),
                    None => {
                        let mut blob = blob.clone();
                        blob.dirty = false;
                        Ok(blob)
                    }
                };
            }
        }

        let contents = if self.prefetch {
            let (contents, prefetches) = self.client.readfile_prefetch(&entry.path)?;
            self.store_prefetches(&entry.path, prefetches);
            contents
        } else {
            self.client.readfile(&entry.path)?
        };

        self.save_contents(&contents)
    }

    /// Write contents to a freshly named blob file, readable only by the
    /// cache owner.
    fn save_contents(&self, contents: &FileContents) -> Result<ContentsBlob> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let storage = self
            .contents_dir()
            .join(Uuid::new_v4().simple().to_string());

        let data = contents.data()?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&storage)?;
        file.write_all(&data)?;

        let storage = storage.to_str().map(str::to_string).ok_or_else(|| {
            Error::Protocol("cache directory path is not valid UTF-8".to_string())
        })?;

        Ok(ContentsBlob {
            storage,
            size: contents.size,
            checksum: contents.checksum.clone(),
            dirty: false,
        })
    }

    /// Install prefetched entries, best-effort.
    ///
    /// Each entry's lock is taken without blocking; losing the race simply
    /// skips that prefetch, except when the prefetch is for the path that
    /// triggered it, whose lock the caller already holds.
    fn store_prefetches(&self, trigger_path: &str, prefetches: Vec<PrefetchEntry>) {
        for prefetch in prefetches {
            let key = self.entry_key(&prefetch.path);
            let guard = self.entry_locks.try_lock(&key);

            if !guard.acquired() && prefetch.path != trigger_path {
                continue;
            }

            if prefetch.contents.is_some() {
                debug!("storing prefetched contents for {}", prefetch.path);
            } else {
                debug!("storing prefetched metadata for {}", prefetch.path);
            }

            {
                let mut entries = self.entries.lock();
                entries.entry(key.clone()).or_insert_with(|| CacheEntry {
                    path: prefetch.path.clone(),
                    meta: prefetch.metadata.clone(),
                    // Never accessed yet: first in line for eviction.
                    last_access: 0.0,
                    last_update: now(),
                    contents: None,
                });
            }

            let wants_contents = match &prefetch.contents {
                Some(_) => self
                    .entries
                    .lock()
                    .get(&key)
                    .map(|e| e.contents.as_ref().map_or(true, |b| b.dirty))
                    .unwrap_or(false),
                None => false,
            };

            if wants_contents {
                if let Some(contents) = &prefetch.contents {
                    match self.save_contents(contents) {
                        Ok(blob) => {
                            let mut entries = self.entries.lock();
                            if let Some(entry) = entries.get_mut(&key) {
                                entry.contents = Some(blob);
                                entry.last_update = now();
                            }
                        }
                        Err(e) => warn!("failed to store prefetched contents: {e}"),
                    }
                }
            }
        }
    }

    /// Delete blob files no longer referenced by any entry.
    fn collect_orphan_blobs(&self, entries: &HashMap<String, CacheEntry>) {
        let mut orphans: std::collections::HashSet<PathBuf> =
            match std::fs::read_dir(self.contents_dir()) {
                Ok(dir) => dir.flatten().map(|e| e.path()).collect(),
                Err(e) => {
                    warn!("failed to list cache contents directory: {e}");
                    return;
                }
            };

        for entry in entries.values() {
            if let Some(blob) = &entry.contents {
                // A referenced blob may already be gone; that resolves itself
                // at the next open.
                orphans.remove(Path::new(&blob.storage));
            }
        }

        for orphan in orphans {
            if let Err(e) = std::fs::remove_file(&orphan) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove orphaned blob {}: {e}", orphan.display());
                }
            }
        }
    }
}

/// Drop contents and then entries, least recently accessed first, until the
/// cache fits its budgets.
fn lru_cleanup(entries: &mut HashMap<String, CacheEntry>, limits: CacheLimits) {
    let mut order: Vec<(String, f64)> = entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.last_access))
        .collect();
    order.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut entry_count = entries.len();
    let mut contents_size: u64 = entries
        .values()
        .filter_map(|e| e.contents.as_ref())
        .map(|b| b.size)
        .sum();

    for (key, _) in order {
        if contents_size > limits.max_size {
            if let Some(entry) = entries.get_mut(&key) {
                if let Some(blob) = entry.contents.take() {
                    contents_size -= blob.size;
                }
            }
        }

        if entry_count > limits.max_entries {
            entries.remove(&key);
            entry_count -= 1;
        }
    }
}

fn open_blob(storage: &str, flags: i32) -> std::io::Result<u64> {
    let path = std::ffi::CString::new(storage)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // Cached files are read-only; the write bits of `flags` never reach the
    // blob because the kernel already denied writes via the cached mode.
    let fd = unsafe { libc::open(path.as_ptr(), flags) };
    if fd == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(fd as u64)
    }
}

/// Advisory cross-process lock on the cache directory's index.
struct IndexLock {
    file: File,
}

impl IndexLock {
    fn acquire(path: &Path) -> Result<IndexLock> {
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(IndexLock { file })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::LocalCache;
    use crate::error::{ErrorKind, RemoteError};

    /// Counting wrapper so tests can assert how often the backend was hit.
    struct CountingService {
        inner: LocalCache,
        metadata_calls: AtomicUsize,
        readfile_calls: AtomicUsize,
    }

    impl CountingService {
        fn new() -> Self {
            CountingService {
                inner: LocalCache::new(),
                metadata_calls: AtomicUsize::new(0),
                readfile_calls: AtomicUsize::new(0),
            }
        }
    }

    impl CacheService for CountingService {
        fn get_metadata(&self, path: &str) -> Result<Metadata> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_metadata(path)
        }

        fn get_changed_metadata(
            &self,
            cached: HashMap<String, Metadata>,
        ) -> Result<HashMap<String, Metadata>> {
            self.inner.get_changed_metadata(cached)
        }

        fn readfile(&self, path: &str) -> Result<FileContents> {
            self.readfile_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.readfile(path)
        }

        fn readfile_conditional(
            &self,
            path: &str,
            checksum: &str,
        ) -> Result<Option<FileContents>> {
            self.inner.readfile_conditional(path, checksum)
        }

        fn get_metadata_prefetch(&self, path: &str) -> Result<(Metadata, Vec<PrefetchEntry>)> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_metadata_prefetch(path)
        }

        fn readfile_prefetch(&self, path: &str) -> Result<(FileContents, Vec<PrefetchEntry>)> {
            self.readfile_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.readfile_prefetch(path)
        }

        fn mark_previously_fetched_contents(&self, paths: Vec<String>) -> Result<()> {
            self.inner.mark_previously_fetched_contents(paths)
        }

        fn set_prefetchable_paths(&self, paths: Option<Vec<String>>) -> Result<()> {
            self.inner.set_prefetchable_paths(paths)
        }

        fn get_app_specific_machine_id(&self) -> Result<String> {
            self.inner.get_app_specific_machine_id()
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        root: PathBuf,
        service: Arc<CountingService>,
    }

    impl Setup {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            Setup {
                _dir: dir,
                root,
                service: Arc::new(CountingService::new()),
            }
        }

        fn cache(&self) -> RemoteCache {
            self.cache_with(false, CacheLimits {
                max_entries: 1024,
                max_size: 1024 * 1024,
            })
        }

        fn cache_with(&self, prefetch: bool, limits: CacheLimits) -> RemoteCache {
            RemoteCache::new(
                self.root.join("cache"),
                "machine",
                Arc::clone(&self.service) as Arc<dyn CacheService>,
                prefetch,
                limits,
                vec![self.root.to_str().unwrap().to_string()],
            )
            .unwrap()
        }

        fn file(&self, name: &str, data: &[u8]) -> String {
            let path = self.root.join(name);
            std::fs::write(&path, data).unwrap();
            path.to_str().unwrap().to_string()
        }
    }

    fn read_via(cache: &RemoteCache, path: &str) -> Vec<u8> {
        let fd = cache.open_contents(path, libc::O_RDONLY).unwrap();
        let data = crate::fs::local::pread(fd, 0, 65536).unwrap();
        crate::fs::local::close(fd).unwrap();
        data
    }

    #[test]
    fn repeated_metadata_hits_the_backend_once() {
        let setup = Setup::new();
        let path = setup.file("file", b"x");
        let cache = setup.cache();

        let first = cache.get_metadata(&path).unwrap();
        for _ in 0..9 {
            assert_eq!(cache.get_metadata(&path).unwrap(), first);
        }

        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_metadata_hits_the_backend_once() {
        let setup = Setup::new();
        let path = setup.file("file", b"x");
        let cache = Arc::new(setup.cache());

        let mut threads = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let path = path.clone();
            threads.push(std::thread::spawn(move || {
                cache.get_metadata(&path).unwrap()
            }));
        }

        let results: Vec<Metadata> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
        for result in &results {
            assert_eq!(result, &results[0]);
            let mode = result.attr.as_ref().unwrap().mode;
            assert_eq!(mode & (libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH), 0);
        }
    }

    #[test]
    fn cached_errors_are_reraised() {
        let setup = Setup::new();
        let cache = setup.cache();
        let missing = format!("{}/missing", setup.root.to_str().unwrap());

        let err = cache.get_metadata(&missing).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);

        // The error itself is served from cache afterwards.
        let err = cache.get_metadata(&missing).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_reads_hit_the_backend_once() {
        let setup = Setup::new();
        let path = setup.file("hello", b"world");
        let cache = setup.cache();

        for _ in 0..10 {
            assert_eq!(read_via(&cache, &path), b"world");
        }

        assert_eq!(setup.service.readfile_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contents_refresh_only_after_sync() {
        let setup = Setup::new();
        let path = setup.file("file", b"foo");
        let cache = setup.cache();

        assert_eq!(read_via(&cache, &path), b"foo");

        std::fs::write(&path, b"foobar").unwrap();
        // Still served from cache: the session assumes cacheable files do
        // not change underneath it.
        assert_eq!(read_via(&cache, &path), b"foo");

        cache.sync().unwrap();
        assert_eq!(read_via(&cache, &path), b"foobar");
    }

    #[test]
    fn sync_drops_contents_for_vanished_files() {
        let setup = Setup::new();
        let path = setup.file("file", b"data");
        let cache = setup.cache();

        assert_eq!(read_via(&cache, &path), b"data");
        std::fs::remove_file(&path).unwrap();

        cache.sync().unwrap();

        assert!(cache.get_metadata(&path).is_err());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let setup = Setup::new();
        let path = setup.file("file", b"payload");

        let cache_a = setup.cache();
        let meta = cache_a.get_metadata(&path).unwrap();
        assert_eq!(read_via(&cache_a, &path), b"payload");
        cache_a.save(true).unwrap();

        let cache_b = setup.cache();
        cache_b.load().unwrap();

        assert_eq!(cache_b.count(), 1);
        assert_eq!(cache_b.get_metadata(&path).unwrap(), meta);
        assert_eq!(read_via(&cache_b, &path), b"payload");

        // Metadata came from the first session; only the reads re-verified.
        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caches_are_partitioned_by_machine() {
        let setup = Setup::new();
        let path = setup.file("file", b"x");

        let cache_a = RemoteCache::new(
            setup.root.join("cache"),
            "machine-a",
            Arc::clone(&setup.service) as Arc<dyn CacheService>,
            false,
            CacheLimits::default(),
            vec![setup.root.to_str().unwrap().to_string()],
        )
        .unwrap();
        cache_a.get_metadata(&path).unwrap();
        cache_a.save(true).unwrap();

        let cache_b = RemoteCache::new(
            setup.root.join("cache"),
            "machine-b",
            Arc::clone(&setup.service) as Arc<dyn CacheService>,
            false,
            CacheLimits::default(),
            vec![setup.root.to_str().unwrap().to_string()],
        )
        .unwrap();
        cache_b.load().unwrap();
        cache_b.get_metadata(&path).unwrap();

        // Separate machines never share entries.
        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lru_keeps_the_most_recently_accessed_entries() {
        let setup = Setup::new();
        for name in ["a", "b", "c", "d"] {
            setup.file(name, b"x");
        }

        let cache = setup.cache_with(
            false,
            CacheLimits {
                max_entries: 3,
                max_size: 1024 * 1024,
            },
        );

        for name in ["a", "b", "c", "d"] {
            let path = format!("{}/{name}", setup.root.to_str().unwrap());
            cache.get_metadata(&path).unwrap();
        }

        cache.save(true).unwrap();
        cache.load().unwrap();

        assert_eq!(cache.count(), 3);
        let keys: Vec<String> = cache.entries.lock().keys().cloned().collect();
        assert!(!keys.iter().any(|k| k.ends_with("/a")));
    }

    #[test]
    fn lru_sheds_contents_before_entries() {
        let setup = Setup::new();
        let cache = setup.cache_with(
            false,
            CacheLimits {
                max_entries: 1024,
                max_size: 3,
            },
        );

        for name in ["a", "b", "c", "d"] {
            let path = setup.file(name, b"1");
            read_via(&cache, &path);
        }

        cache.save(true).unwrap();
        cache.load().unwrap();

        assert_eq!(cache.count(), 4);
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn orphaned_blobs_are_garbage_collected() {
        let setup = Setup::new();
        let cache = setup.cache_with(
            false,
            CacheLimits {
                max_entries: 1024,
                max_size: 3,
            },
        );

        for name in ["a", "b", "c", "d"] {
            let path = setup.file(name, b"1");
            read_via(&cache, &path);
        }

        cache.save(true).unwrap();

        let contents_dir = setup.root.join("cache").join("contents");
        let on_disk: Vec<_> = std::fs::read_dir(&contents_dir).unwrap().flatten().collect();
        assert_eq!(on_disk.len(), 3);

        let referenced: std::collections::HashSet<String> = cache
            .entries
            .lock()
            .values()
            .filter_map(|e| e.contents.as_ref())
            .map(|b| b.storage.clone())
            .collect();
        for file in on_disk {
            assert!(referenced.contains(file.path().to_str().unwrap()));
        }
    }

    #[test]
    fn vanished_blob_files_are_refetched_once() {
        let setup = Setup::new();
        let path = setup.file("file", b"data");
        let cache = setup.cache();

        assert_eq!(read_via(&cache, &path), b"data");

        // Remove the blob out from under the cache.
        let storage = cache
            .entries
            .lock()
            .values()
            .next()
            .unwrap()
            .contents
            .as_ref()
            .unwrap()
            .storage
            .clone();
        std::fs::remove_file(&storage).unwrap();

        assert_eq!(read_via(&cache, &path), b"data");
    }

    #[test]
    fn merge_prefers_the_most_recently_updated_entry() {
        let setup = Setup::new();
        let path = setup.file("file", b"v1");

        let cache_a = setup.cache();
        let cache_b = setup.cache();

        cache_a.get_metadata(&path).unwrap();
        cache_b.get_metadata(&path).unwrap();

        // Make B's copy strictly newer with different metadata.
        {
            let mut entries = cache_b.entries.lock();
            let entry = entries.values_mut().next().unwrap();
            entry.meta = Metadata::from_error(RemoteError::new(ErrorKind::NotFound, "gone"));
            entry.last_update = now() + 1000.0;
        }

        cache_a.save(true).unwrap();
        cache_b.save(true).unwrap();

        let cache_c = setup.cache();
        cache_c.load().unwrap();
        assert!(cache_c.get_metadata(&path).is_err());
    }

    #[test]
    fn prefetched_symlink_targets_fill_the_cache() {
        let setup = Setup::new();
        let target = setup.file("target", b"x");
        let link_path = setup.root.join("link");
        std::os::unix::fs::symlink(&target, &link_path).unwrap();
        let link = link_path.to_str().unwrap().to_string();

        let cache = setup.cache_with(true, CacheLimits::default());

        cache.get_metadata(&link).unwrap();

        // One bulk call produced both the link's and the target's entries.
        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.count(), 2);

        cache.get_metadata(&target).unwrap();
        assert_eq!(setup.service.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefetched_entries_are_evicted_first() {
        let setup = Setup::new();
        let target = setup.file("target", b"x");
        let link_path = setup.root.join("link");
        std::os::unix::fs::symlink(&target, &link_path).unwrap();
        let link = link_path.to_str().unwrap().to_string();

        let cache = setup.cache_with(
            true,
            CacheLimits {
                max_entries: 1,
                max_size: 1024,
            },
        );

        cache.get_metadata(&link).unwrap();
        cache.save(true).unwrap();

        // The never-accessed prefetched target goes before the link.
        let keys: Vec<String> = cache.entries.lock().keys().cloned().collect();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("/link"));
    }
}
