//! Cache key extraction and on-disk filename derivation

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Extension given to every cached data file
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Number of digest bytes kept in a cache filename
const FILENAME_DIGEST_BYTES: usize = 16;

/// Maps a domain value to the stable string key the cache indexes by
///
/// Implementations must be deterministic: the same value always yields the
/// same key, across processes and restarts.
pub trait CacheKey {
    /// The stable key for this value
    fn cache_key(&self) -> String;
}

impl CacheKey for str {
    fn cache_key(&self) -> String {
        self.to_owned()
    }
}

impl CacheKey for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

impl CacheKey for Path {
    fn cache_key(&self) -> String {
        self.to_string_lossy().into_owned()
    }
}

impl CacheKey for PathBuf {
    fn cache_key(&self) -> String {
        self.as_path().cache_key()
    }
}

impl<T: CacheKey + ?Sized> CacheKey for &T {
    fn cache_key(&self) -> String {
        (**self).cache_key()
    }
}

/// Derive the on-disk filename for a cache key
///
/// The name is the hex encoding of a truncated SHA-256 of the key, so it is
/// filesystem-safe regardless of what characters the key contains.
#[must_use]
pub fn filename_for_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!(
        "{}.{CACHE_FILE_EXTENSION}",
        hex::encode(&digest[..FILENAME_DIGEST_BYTES])
    )
}

/// Whether a filename looks like one produced by [`filename_for_key`]
#[must_use]
pub fn is_cache_filename(name: &str) -> bool {
    name.strip_suffix(CACHE_FILE_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| {
            stem.len() == FILENAME_DIGEST_BYTES * 2 && stem.chars().all(|c| c.is_ascii_hexdigit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_is_deterministic() {
        assert_eq!(
            filename_for_key("https://cdn.example.com/a.mp3"),
            filename_for_key("https://cdn.example.com/a.mp3")
        );
    }

    #[test]
    fn test_filename_differs_per_key() {
        assert_ne!(filename_for_key("post-1"), filename_for_key("post-2"));
    }

    #[test]
    fn test_filename_shape() {
        let name = filename_for_key("anything/with:odd?chars");
        assert!(name.ends_with(".cache"));
        assert_eq!(name.len(), 32 + ".cache".len());
        assert!(is_cache_filename(&name));
    }

    #[test]
    fn test_is_cache_filename_rejects_others() {
        assert!(!is_cache_filename("manifest.json"));
        assert!(!is_cache_filename("deadbeef.cache"));
        assert!(!is_cache_filename(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz.cache"
        ));
    }

    #[test]
    fn test_cache_key_impls_agree() {
        let owned = String::from("waveform/42");
        assert_eq!(owned.cache_key(), "waveform/42".cache_key());
        assert_eq!(Path::new("a/b.wav").cache_key(), "a/b.wav");
        assert_eq!(PathBuf::from("a/b.wav").cache_key(), "a/b.wav");
        assert_eq!((&owned).cache_key(), owned);
    }
}
