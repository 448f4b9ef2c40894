//! Least-recently-used eviction
//!
//! Eviction happens in two steps. [`plan`] picks victims from a manifest
//! without touching the disk; [`execute`] deletes their files and only then
//! drops them from the manifest. An entry whose file cannot be deleted stays
//! in the manifest so the file is never orphaned.

use crate::manifest::{CacheEntry, Manifest};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Fraction of the maximum size eviction trims down to
pub const DEFAULT_EVICTION_RATIO: f64 = 0.8;

/// Victims chosen for eviction, oldest access first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionPlan {
    /// Entries to delete, in eviction order
    pub victims: Vec<CacheEntry>,
    /// Total cache size once every victim is gone
    pub projected_size: u64,
}

impl EvictionPlan {
    /// Whether there is nothing to evict
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Keys whose file and manifest entry were removed
    pub evicted: Vec<String>,
    /// Keys whose file could not be deleted and were kept
    pub failed: Vec<String>,
    /// Bytes released by the evicted files
    pub bytes_freed: u64,
}

/// Size eviction trims down to for a given limit
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
#[must_use]
pub fn target_size(max_size: u64, ratio: f64) -> u64 {
    (max_size as f64 * ratio).floor() as u64
}

/// Choose the least recently accessed entries to bring the cache to `target`
///
/// `protected` names a key that must survive regardless of its age, used for
/// the entry that triggered the eviction.
#[must_use]
pub fn plan(manifest: &Manifest, target: u64, protected: Option<&str>) -> EvictionPlan {
    let mut remaining = manifest.total_size();
    let mut victims = Vec::new();

    for entry in manifest.entries_by_access() {
        if remaining <= target {
            break;
        }
        if protected == Some(entry.key.as_str()) {
            continue;
        }
        remaining = remaining.saturating_sub(entry.file_size);
        victims.push(entry.clone());
    }

    EvictionPlan {
        victims,
        projected_size: remaining,
    }
}

/// Delete the planned victims from `dir` and drop them from the manifest
pub fn execute(manifest: &mut Manifest, dir: &Path, plan: EvictionPlan) -> EvictionReport {
    let mut report = EvictionReport::default();

    for victim in plan.victims {
        let path = dir.join(&victim.filename);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(key = %victim.key, "Evicted file was already gone");
            }
            Err(e) => {
                tracing::warn!(
                    key = %victim.key,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete cached file during eviction, keeping entry"
                );
                report.failed.push(victim.key);
                continue;
            }
        }

        if manifest.remove(&victim.key).is_some() {
            report.bytes_freed += victim.file_size;
            tracing::debug!(
                key = %victim.key,
                size = victim.file_size,
                "Evicted cache entry"
            );
            report.evicted.push(victim.key);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::key::filename_for_key;
    use proptest::prelude::*;
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

    #[test]
    fn test_target_size_uses_ratio() {
        assert_eq!(target_size(1000, DEFAULT_EVICTION_RATIO), 800);
        assert_eq!(target_size(1000, 1.0), 1000);
        assert_eq!(target_size(999, 0.5), 499);
    }

    #[test]
    fn test_plan_nothing_when_under_target() {
        let mut m = Manifest::new();
        m.insert(entry("a", 100, 1.0));
        assert!(plan(&m, 800, None).is_empty());
    }

    #[test]
    fn test_plan_picks_oldest_until_under_target() {
        let mut m = Manifest::new();
        m.insert(entry("a", 400, 3.0));
        m.insert(entry("b", 400, 2.0));
        m.insert(entry("c", 400, 4.0));

        let p = plan(&m, 800, Some("c"));
        let keys: Vec<&str> = p.victims.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["b"]);
        assert_eq!(p.projected_size, 800);
    }

    #[test]
    fn test_plan_skips_protected_even_if_oldest() {
        let mut m = Manifest::new();
        m.insert(entry("new", 600, 1.0));
        m.insert(entry("old", 600, 2.0));

        let p = plan(&m, 800, Some("new"));
        assert_eq!(p.victims.len(), 1);
        assert_eq!(p.victims[0].key, "old");
    }

    #[test]
    fn test_execute_removes_files_and_entries() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new();
        for (key, at) in [("a", 1.0), ("b", 2.0)] {
            fs::write(dir.path().join(filename_for_key(key)), [0u8; 10]).unwrap();
            m.insert(entry(key, 10, at));
        }

        let p = plan(&m, 10, None);
        let report = execute(&mut m, dir.path(), p);

        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert_eq!(report.bytes_freed, 10);
        assert!(report.failed.is_empty());
        assert!(!dir.path().join(filename_for_key("a")).exists());
        assert!(dir.path().join(filename_for_key("b")).exists());
        assert_eq!(m.total_size(), 10);
    }

    #[test]
    fn test_execute_treats_missing_file_as_evicted() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new();
        m.insert(entry("ghost", 50, 1.0));

        let p = plan(&m, 0, None);
        let report = execute(&mut m, dir.path(), p);
        assert_eq!(report.evicted, vec!["ghost".to_string()]);
        assert!(m.is_empty());
    }

    #[test]
    fn test_execute_keeps_entry_when_delete_fails() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new();
        // A non-empty directory where the file should be makes remove_file fail
        let blocker = dir.path().join(filename_for_key("stuck"));
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("inner"), b"x").unwrap();
        m.insert(entry("stuck", 50, 1.0));

        let p = plan(&m, 0, None);
        let report = execute(&mut m, dir.path(), p);
        assert_eq!(report.failed, vec!["stuck".to_string()]);
        assert!(report.evicted.is_empty());
        assert!(m.contains("stuck"));
    }

    proptest! {
        /// Victims are exactly the oldest unprotected entries, and removing
        /// them brings the total to the target whenever that is possible.
        #[test]
        fn plan_evicts_oldest_prefix(
            sizes in prop::collection::vec(1u64..500, 1..30),
            target in 0u64..5000,
        ) {
            let mut m = Manifest::new();
            for (i, size) in sizes.iter().enumerate() {
                #[allow(clippy::cast_precision_loss)]
                let at = i as f64;
                m.insert(entry(&format!("k{i}"), *size, at));
            }

            let p = plan(&m, target, None);
            let victim_keys: Vec<String> = p.victims.iter().map(|v| v.key.clone()).collect();
            let expected: Vec<String> = (0..victim_keys.len()).map(|i| format!("k{i}")).collect();
            prop_assert_eq!(victim_keys, expected);

            let total: u64 = sizes.iter().sum();
            let freed: u64 = p.victims.iter().map(|v| v.file_size).sum();
            prop_assert_eq!(p.projected_size, total - freed);
            prop_assert!(p.projected_size <= target || p.victims.len() == sizes.len());
        }
    }
}
