//! Manifest store: the on-disk index of cached files
//!
//! The manifest is a JSON array of [`CacheEntry`] records kept in a sidecar
//! file next to the cached data:
//!
//! ```text
//! <cache dir>/
//!   manifest.json
//!   3f2a...9c.cache
//!   b81e...07.cache
//! ```
//!
//! It is read in full on open and rewritten in full after every mutation.
//! Rewrites go through a temporary file and a rename so a crash mid-write
//! never leaves a truncated manifest behind.

use crate::key::filename_for_key;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the manifest sidecar file inside the cache directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Smallest step between two access stamps handed out by one manifest
const STAMP_RESOLUTION_SECS: f64 = 1e-6;

/// One cached file as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key the file was stored under
    pub key: String,
    /// Filename inside the cache directory, derived from the key
    pub filename: String,
    /// Size of the file on disk in bytes
    pub file_size: u64,
    /// Last read or write, in seconds since the Unix epoch
    pub last_access_time: f64,
    /// When the entry stops being served, in seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

impl CacheEntry {
    /// Whether the entry's time to live has run out at `now`
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory view of the manifest
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: BTreeMap<String, CacheEntry>,
    total_size: u64,
    last_stamp: f64,
}

/// Current wall-clock time in seconds since the Unix epoch
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Path of the manifest file for a cache directory
#[must_use]
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

impl Manifest {
    /// Create an empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the manifest for `dir`, reconciling it against the files on disk
    ///
    /// A missing manifest yields an empty one. An unreadable or corrupt
    /// manifest is discarded with a warning rather than repaired. Entries
    /// whose backing file is gone are dropped, and every surviving entry has
    /// its size refreshed from the file's metadata.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let path = manifest_path(dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read cache manifest, starting empty"
                );
                return Self::new();
            }
        };

        let records: Vec<CacheEntry> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cache manifest is corrupt, discarding it"
                );
                return Self::new();
            }
        };

        let mut manifest = Self::new();
        for mut entry in records {
            if entry.filename != filename_for_key(&entry.key) {
                tracing::warn!(
                    key = %entry.key,
                    filename = %entry.filename,
                    "Manifest entry filename does not match its key, dropping"
                );
                continue;
            }
            match fs::metadata(dir.join(&entry.filename)) {
                Ok(meta) if meta.is_file() => {
                    entry.file_size = meta.len();
                    manifest.last_stamp = manifest.last_stamp.max(entry.last_access_time);
                    manifest.insert(entry);
                }
                _ => {
                    tracing::debug!(
                        key = %entry.key,
                        filename = %entry.filename,
                        "Cached file missing on disk, dropping manifest entry"
                    );
                }
            }
        }

        tracing::debug!(
            entries = manifest.len(),
            total_size = manifest.total_size,
            "Loaded cache manifest"
        );
        manifest
    }

    /// Persist the manifest into `dir`, replacing the previous file atomically
    ///
    /// # Errors
    ///
    /// Returns error if serialization or any filesystem step fails
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = manifest_path(dir);
        let records: Vec<&CacheEntry> = self.entries.values().collect();
        let json = serde_json::to_vec_pretty(&records).map_err(|e| Error::manifest(&path, e))?;

        let tmp_path = path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&tmp_path).map_err(|e| Error::io(e, &tmp_path, "create"))?;
        file.write_all(&json)
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;
        file.sync_all()
            .map_err(|e| Error::io(e, &tmp_path, "sync"))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(|e| Error::io(e, &path, "rename"))?;
        Ok(())
    }

    /// Hand out an access stamp strictly greater than every earlier one
    pub fn next_stamp(&mut self) -> f64 {
        let stamp = now_secs().max(self.last_stamp + STAMP_RESOLUTION_SECS);
        self.last_stamp = stamp;
        stamp
    }

    /// Insert or replace an entry, returning the replaced one
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_size = self.total_size.saturating_add(entry.file_size);
        let previous = self.entries.insert(entry.key.clone(), entry);
        if let Some(prev) = &previous {
            self.total_size = self.total_size.saturating_sub(prev.file_size);
        }
        previous
    }

    /// Remove an entry by key
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(removed.file_size);
        Some(removed)
    }

    /// Look up an entry by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Whether the manifest tracks `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Mark an entry as just accessed, returning the new stamp
    pub fn touch(&mut self, key: &str) -> Option<f64> {
        if !self.entries.contains_key(key) {
            return None;
        }
        let stamp = self.next_stamp();
        let entry = self.entries.get_mut(key)?;
        entry.last_access_time = stamp;
        Some(stamp)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    /// Number of tracked entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all tracked file sizes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Entries sorted from least to most recently accessed
    #[must_use]
    pub fn entries_by_access(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.last_access_time.total_cmp(&b.last_access_time));
        entries
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]

    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, size: u64, at: f64) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            filename: filename_for_key(key),
            file_size: size,
            last_access_time: at,
            expires_at: None,
        }
    }

    fn write_data(dir: &Path, key: &str, bytes: &[u8]) {
        fs::write(dir.join(filename_for_key(key)), bytes).unwrap();
    }

    #[test]
    fn test_insert_replace_tracks_total() {
        let mut m = Manifest::new();
        m.insert(entry("a", 10, 1.0));
        m.insert(entry("b", 20, 2.0));
        assert_eq!(m.total_size(), 30);

        let prev = m.insert(entry("a", 5, 3.0)).unwrap();
        assert_eq!(prev.file_size, 10);
        assert_eq!(m.total_size(), 25);

        m.remove("b");
        assert_eq!(m.total_size(), 5);
        assert!(m.remove("missing").is_none());
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let mut m = Manifest::new();
        let mut previous = m.next_stamp();
        for _ in 0..1000 {
            let next = m.next_stamp();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_entries_by_access_orders_oldest_first() {
        let mut m = Manifest::new();
        m.insert(entry("late", 1, 30.0));
        m.insert(entry("early", 1, 10.0));
        m.insert(entry("middle", 1, 20.0));
        let order: Vec<&str> = m
            .entries_by_access()
            .iter()
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_json_uses_camel_case_array() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "k", b"abc");
        let mut m = Manifest::new();
        m.insert(entry("k", 3, 1.5));
        m.save(dir.path()).unwrap();

        let raw = fs::read_to_string(manifest_path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let first = &value.as_array().unwrap()[0];
        assert_eq!(first["key"], "k");
        assert_eq!(first["fileSize"], 3);
        assert_eq!(first["lastAccessTime"], 1.5);
        assert!(first.get("filename").is_some());
    }

    #[test]
    fn test_expiry_is_optional_in_json() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "forever", b"a");
        write_data(dir.path(), "brief", b"b");
        let mut m = Manifest::new();
        m.insert(entry("forever", 1, 1.0));
        m.insert(CacheEntry {
            expires_at: Some(10.0),
            ..entry("brief", 1, 2.0)
        });
        m.save(dir.path()).unwrap();

        let raw = fs::read_to_string(manifest_path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let records = value.as_array().unwrap();
        let brief = records.iter().find(|r| r["key"] == "brief").unwrap();
        let forever = records.iter().find(|r| r["key"] == "forever").unwrap();
        assert_eq!(brief["expiresAt"], 10.0);
        assert!(forever.get("expiresAt").is_none());

        let loaded = Manifest::load(dir.path());
        assert_eq!(loaded.get("brief").unwrap().expires_at, Some(10.0));
        assert_eq!(loaded.get("forever").unwrap().expires_at, None);
    }

    #[test]
    fn test_is_expired() {
        let forever = entry("k", 1, 1.0);
        assert!(!forever.is_expired(f64::MAX));

        let brief = CacheEntry {
            expires_at: Some(10.0),
            ..forever
        };
        assert!(!brief.is_expired(9.5));
        assert!(brief.is_expired(10.0));
    }

    #[test]
    fn test_save_then_load_keeps_entries_with_files() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "kept", b"hello");
        let mut m = Manifest::new();
        m.insert(entry("kept", 5, 1.0));
        m.insert(entry("gone", 7, 2.0));
        m.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path());
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains("kept"));
        assert!(!loaded.contains("gone"));
        assert_eq!(loaded.total_size(), 5);
    }

    #[test]
    fn test_load_refreshes_size_from_disk() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "k", b"twelve bytes");
        let mut m = Manifest::new();
        m.insert(entry("k", 999, 1.0));
        m.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path());
        assert_eq!(loaded.get("k").unwrap().file_size, 12);
    }

    #[test]
    fn test_load_corrupt_manifest_starts_empty() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "k", b"data");
        fs::write(manifest_path(dir.path()), "{ not json").unwrap();

        let loaded = Manifest::load(dir.path());
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_drops_mismatched_filename() {
        let dir = TempDir::new().unwrap();
        let records = serde_json::json!([{
            "key": "k",
            "filename": "../escape.cache",
            "fileSize": 1,
            "lastAccessTime": 1.0
        }]);
        fs::write(manifest_path(dir.path()), records.to_string()).unwrap();

        assert!(Manifest::load(dir.path()).is_empty());
    }

    #[test]
    fn test_load_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(dir.path()).is_empty());
    }

    #[test]
    fn test_loaded_stamps_continue_after_stored_ones() {
        let dir = TempDir::new().unwrap();
        write_data(dir.path(), "future", b"x");
        let far_future = now_secs() + 10_000.0;
        let mut m = Manifest::new();
        m.insert(entry("future", 1, far_future));
        m.save(dir.path()).unwrap();

        let mut loaded = Manifest::load(dir.path());
        assert!(loaded.next_stamp() > far_future);
    }
}
