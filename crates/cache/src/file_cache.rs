//! File cache façade coordinating the manifest and the files on disk
//!
//! A single [`RwLock`] guards the manifest. Every operation that touches a
//! cached file holds the write lock for the whole file operation, so the
//! manifest and the directory contents never drift apart under concurrency.
//!
//! The core operations ([`FileCache::get_file`],
//! [`FileCache::cache_file`], [`FileCache::remove_file`],
//! [`FileCache::clear`]) never return errors. Failures are logged and
//! reported as a miss or a `None`, and callers fall back to re-fetching.
//!
//! Entries stored through the `*_with_ttl` variants carry an expiry time.
//! An expired entry is served as a miss and deleted the first time it is
//! looked up, when the cache is opened, or on [`FileCache::remove_expired`].

use crate::config::FileCacheConfig;
use crate::eviction::{self, EvictionReport};
use crate::key::{CacheKey, filename_for_key, is_cache_filename};
use crate::manifest::{CacheEntry, MANIFEST_FILE, Manifest, now_secs};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Suffix of in-flight writes that have not been renamed into place yet
const PARTIAL_SUFFIX: &str = ".partial";

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of cached files
    pub entries: usize,
    /// Bytes currently cached
    pub total_bytes: u64,
    /// Configured size limit
    pub max_bytes: u64,
    /// Lookups that returned a file
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed by eviction
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0 when nothing was looked up
    pub hit_rate: f64,
}

/// Persistent file cache with a size budget and LRU eviction
#[derive(Debug)]
pub struct FileCache {
    config: FileCacheConfig,
    manifest: RwLock<Manifest>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FileCache {
    /// Open (or create) the cache described by `config`
    ///
    /// The manifest is reconciled against the directory: entries without a
    /// file are dropped, expired entries are deleted, and stray data files
    /// nobody tracks are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache
    /// directory cannot be created
    pub fn open(config: FileCacheConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.directory();
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;

        let manifest = Manifest::load(dir);
        let cache = Self {
            config,
            manifest: RwLock::new(manifest),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };

        {
            let mut manifest = cache.manifest.write();
            cache.remove_expired_locked(&mut manifest, now_secs());
            cache.prune_orphans_locked(&manifest);
            cache.persist(&manifest);
            if manifest.total_size() > cache.config.max_size_bytes() {
                cache.evict_locked(&mut manifest, None);
            }
        }

        tracing::info!(
            dir = %cache.config.directory().display(),
            entries = cache.len(),
            total_size = cache.total_size(),
            max_size = cache.config.max_size_bytes(),
            "Opened file cache"
        );
        Ok(cache)
    }

    /// The configuration this cache was opened with
    #[must_use]
    pub fn config(&self) -> &FileCacheConfig {
        &self.config
    }

    /// Directory holding the cached files
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.config.directory()
    }

    /// Configured size limit in bytes
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.config.max_size_bytes()
    }

    /// Look up a cached file
    ///
    /// Returns the path of the cached copy when the key is known and its file
    /// still exists and has not expired. A manifest entry whose file has
    /// vanished is deregistered, and an expired one is deleted along with its
    /// file; both are reported as a miss. A hit refreshes the entry's access
    /// time.
    pub fn get_file<K: CacheKey + ?Sized>(&self, key: &K) -> Option<PathBuf> {
        let key = key.cache_key();
        let mut manifest = self.manifest.write();

        let Some(entry) = manifest.get(&key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Cache miss");
            return None;
        };

        let path = self.directory().join(&entry.filename);
        if entry.is_expired(now_secs()) {
            manifest.remove(&key);
            self.delete_data_file(&key, &path);
            self.persist(&manifest);
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Cache entry expired");
            return None;
        }
        if !path.is_file() {
            tracing::warn!(
                key = %key,
                path = %path.display(),
                "Cached file missing on disk, dropping stale entry"
            );
            manifest.remove(&key);
            self.persist(&manifest);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        manifest.touch(&key);
        self.persist(&manifest);
        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "Cache hit");
        Some(path)
    }

    /// Copy `source` into the cache under `key`
    ///
    /// Returns the path of the cached copy, or `None` if the copy failed, in
    /// which case the manifest is left exactly as it was.
    pub fn cache_file<K: CacheKey + ?Sized>(&self, key: &K, source: &Path) -> Option<PathBuf> {
        let key = key.cache_key();
        logged(&key, self.copy_in(&key, source, None), Some(source))
    }

    /// Like [`FileCache::cache_file`], but the entry expires after `ttl`
    pub fn cache_file_with_ttl<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        source: &Path,
        ttl: Duration,
    ) -> Option<PathBuf> {
        let key = key.cache_key();
        logged(&key, self.copy_in(&key, source, Some(ttl)), Some(source))
    }

    /// Fallible form of [`FileCache::cache_file`]
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty, the source is not a readable
    /// file, the source exceeds the cache limit, or the copy fails
    pub fn try_cache_file<K: CacheKey + ?Sized>(&self, key: &K, source: &Path) -> Result<PathBuf> {
        self.copy_in(&key.cache_key(), source, None)
    }

    /// Fallible form of [`FileCache::cache_file_with_ttl`]
    ///
    /// # Errors
    ///
    /// Same as [`FileCache::try_cache_file`]
    pub fn try_cache_file_with_ttl<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        source: &Path,
        ttl: Duration,
    ) -> Result<PathBuf> {
        self.copy_in(&key.cache_key(), source, Some(ttl))
    }

    /// Store an in-memory payload under `key`
    ///
    /// Same contract as [`FileCache::cache_file`].
    pub fn cache_bytes<K: CacheKey + ?Sized>(&self, key: &K, bytes: &[u8]) -> Option<PathBuf> {
        let key = key.cache_key();
        logged(&key, self.write_in(&key, bytes, None), None)
    }

    /// Like [`FileCache::cache_bytes`], but the entry expires after `ttl`
    pub fn cache_bytes_with_ttl<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        bytes: &[u8],
        ttl: Duration,
    ) -> Option<PathBuf> {
        let key = key.cache_key();
        logged(&key, self.write_in(&key, bytes, Some(ttl)), None)
    }

    /// Fallible form of [`FileCache::cache_bytes`]
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty, the payload exceeds the cache
    /// limit, or the write fails
    pub fn try_cache_bytes<K: CacheKey + ?Sized>(&self, key: &K, bytes: &[u8]) -> Result<PathBuf> {
        self.write_in(&key.cache_key(), bytes, None)
    }

    /// Fallible form of [`FileCache::cache_bytes_with_ttl`]
    ///
    /// # Errors
    ///
    /// Same as [`FileCache::try_cache_bytes`]
    pub fn try_cache_bytes_with_ttl<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        bytes: &[u8],
        ttl: Duration,
    ) -> Result<PathBuf> {
        self.write_in(&key.cache_key(), bytes, Some(ttl))
    }

    /// Remove a cached file and its manifest entry
    ///
    /// Unknown keys are a no-op.
    pub fn remove_file<K: CacheKey + ?Sized>(&self, key: &K) {
        let key = key.cache_key();
        let mut manifest = self.manifest.write();
        let Some(entry) = manifest.remove(&key) else {
            return;
        };

        let path = self.directory().join(&entry.filename);
        self.delete_data_file(&key, &path);
        self.persist(&manifest);
        tracing::debug!(key = %key, "Removed cache entry");
    }

    /// Delete every entry whose time to live has run out
    ///
    /// Returns how many entries were dropped.
    pub fn remove_expired(&self) -> usize {
        let mut manifest = self.manifest.write();
        self.remove_expired_locked(&mut manifest, now_secs())
    }

    /// Delete every cached file and reset the manifest
    pub fn clear(&self) {
        let mut manifest = self.manifest.write();
        let dir = self.directory();

        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to delete cache directory");
            }
        }
        if let Err(e) = fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to recreate cache directory");
        }

        let dropped = manifest.len();
        manifest.clear();
        self.persist(&manifest);
        tracing::info!(entries = dropped, "Cleared file cache");
    }

    /// Evict least recently used entries until at most `target_bytes` remain
    pub fn evict_to(&self, target_bytes: u64) -> EvictionReport {
        let mut manifest = self.manifest.write();
        let plan = eviction::plan(&manifest, target_bytes, None);
        self.apply_eviction(&mut manifest, plan)
    }

    /// Whether `key` is currently tracked
    #[must_use]
    pub fn contains<K: CacheKey + ?Sized>(&self, key: &K) -> bool {
        self.manifest.read().contains(&key.cache_key())
    }

    /// Number of cached files
    #[must_use]
    pub fn len(&self) -> usize {
        self.manifest.read().len()
    }

    /// Whether the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifest.read().is_empty()
    }

    /// Bytes currently cached
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.manifest.read().total_size()
    }

    /// Snapshot of all entries, least recently accessed first
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.manifest
            .read()
            .entries_by_access()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = {
            let manifest = self.manifest.read();
            (manifest.len(), manifest.total_size())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        CacheStats {
            entries,
            total_bytes,
            max_bytes: self.max_size(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
        }
    }

    fn copy_in(&self, key: &str, source: &Path, ttl: Option<Duration>) -> Result<PathBuf> {
        let meta = fs::metadata(source).map_err(|e| Error::io(e, source, "metadata"))?;
        if !meta.is_file() {
            return Err(Error::io(
                std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
                source,
                "copy",
            ));
        }
        self.store(key, meta.len(), ttl, |tmp| {
            fs::copy(source, tmp)
                .map(|_| ())
                .map_err(|e| Error::io(e, tmp, "copy"))
        })
    }

    fn write_in(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<PathBuf> {
        self.store(key, bytes.len() as u64, ttl, |tmp| {
            fs::write(tmp, bytes).map_err(|e| Error::io(e, tmp, "write"))
        })
    }

    /// Write a payload to a temporary file, move it into place and record it
    fn store<F>(&self, key: &str, size: u64, ttl: Option<Duration>, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if key.is_empty() {
            return Err(Error::invalid_key("cache key must not be empty"));
        }
        let max = self.max_size();
        if size > max {
            return Err(Error::TooLarge { size, max });
        }

        let mut manifest = self.manifest.write();
        let dir = self.directory();
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;

        let filename = filename_for_key(key);
        let dest = dir.join(&filename);
        let tmp = dir.join(format!("{filename}{PARTIAL_SUFFIX}"));

        if let Err(e) = write(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::io(e, &dest, "rename"));
        }
        // The rename already replaced the old file, so record the entry either way
        let file_size = stored_size(&dest, size);

        let last_access_time = manifest.next_stamp();
        manifest.insert(CacheEntry {
            key: key.to_owned(),
            filename,
            file_size,
            last_access_time,
            expires_at: ttl.map(|ttl| last_access_time + ttl.as_secs_f64()),
        });
        self.persist(&manifest);
        tracing::debug!(key = %key, size = file_size, "Cached file");

        if manifest.total_size() > max {
            self.evict_locked(&mut manifest, Some(key));
        }
        Ok(dest)
    }

    /// Trim to the configured target while the write lock is held
    fn evict_locked(&self, manifest: &mut Manifest, protected: Option<&str>) -> EvictionReport {
        let target = eviction::target_size(self.max_size(), self.config.eviction_ratio());
        let plan = eviction::plan(manifest, target, protected);
        self.apply_eviction(manifest, plan)
    }

    fn apply_eviction(&self, manifest: &mut Manifest, plan: eviction::EvictionPlan) -> EvictionReport {
        if plan.is_empty() {
            return EvictionReport::default();
        }
        let report = eviction::execute(manifest, self.directory(), plan);
        self.evictions
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        self.persist(manifest);
        tracing::info!(
            evicted = report.evicted.len(),
            failed = report.failed.len(),
            bytes_freed = report.bytes_freed,
            total_size = manifest.total_size(),
            "Evicted least recently used cache entries"
        );
        report
    }

    fn remove_expired_locked(&self, manifest: &mut Manifest, now: f64) -> usize {
        let expired: Vec<CacheEntry> = manifest
            .iter()
            .filter(|entry| entry.is_expired(now))
            .cloned()
            .collect();
        if expired.is_empty() {
            return 0;
        }
        for entry in &expired {
            manifest.remove(&entry.key);
            self.delete_data_file(&entry.key, &self.directory().join(&entry.filename));
        }
        self.persist(manifest);
        tracing::info!(removed = expired.len(), "Removed expired cache entries");
        expired.len()
    }

    fn delete_data_file(&self, key: &str, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                // Forgotten either way; the next open sweeps the orphan
                tracing::warn!(
                    key = %key,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete cached file"
                );
            }
        }
    }

    /// Delete data files and leftover partial writes the manifest does not track
    fn prune_orphans_locked(&self, manifest: &Manifest) -> usize {
        let dir = self.directory();
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan cache directory");
                return 0;
            }
        };

        let tracked: std::collections::HashSet<&str> =
            manifest.iter().map(|e| e.filename.as_str()).collect();
        let mut removed = 0;
        for entry in read_dir.filter_map(std::result::Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE || tracked.contains(name.as_str()) {
                continue;
            }
            let stray = name.ends_with(PARTIAL_SUFFIX) || is_cache_filename(&name);
            if stray && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed untracked files from cache directory");
        }
        removed
    }

    fn persist(&self, manifest: &Manifest) {
        if let Err(e) = manifest.save(self.directory()) {
            tracing::warn!(error = %e, "Failed to persist cache manifest");
        }
    }
}

/// Size of a freshly stored file, falling back to the size that was written
fn stored_size(dest: &Path, written: u64) -> u64 {
    match fs::metadata(dest) {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!(
                path = %dest.display(),
                error = %e,
                "Failed to stat cached file, recording the written size"
            );
            written
        }
    }
}

fn logged(key: &str, stored: Result<PathBuf>, source: Option<&Path>) -> Option<PathBuf> {
    match stored {
        Ok(path) => Some(path),
        Err(e) => {
            match source {
                Some(source) => tracing::warn!(
                    key = %key,
                    source = %source.display(),
                    error = %e,
                    "Failed to cache file"
                ),
                None => tracing::warn!(key = %key, error = %e, "Failed to cache payload"),
            }
            None
        }
    }
}
