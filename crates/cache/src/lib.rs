//! Manifest-backed file cache with least-recently-used eviction
//!
//! This crate keeps downloaded media (audio previews, waveforms, avatars)
//! on disk between sessions under a fixed size budget:
//! - Keys map to deterministic, hash-derived filenames
//! - A JSON manifest records size and last access time per key
//! - Exceeding the budget evicts the least recently used files down to 80%
//!   of the limit
//!
//! # Overview
//!
//! ```rust,no_run
//! use sidechain_cache::{FileCache, FileCacheConfig};
//! use std::path::Path;
//!
//! let config = FileCacheConfig::builder()
//!     .directory("/tmp/sidechain-cache")
//!     .max_size_bytes(64 * 1024 * 1024)
//!     .build()?;
//! let cache = FileCache::open(config)?;
//!
//! if cache.get_file("post/42/audio").is_none() {
//!     cache.cache_file("post/42/audio", Path::new("/tmp/download.mp3"));
//! }
//! # Ok::<(), sidechain_cache::Error>(())
//! ```
//!
//! # Failure model
//!
//! Cache operations never fail loudly. A missing key, a failed copy, or a
//! corrupt manifest all degrade to a cache miss with a logged warning, and the
//! caller re-fetches from the network.

pub mod config;
mod error;
pub mod eviction;
pub mod file_cache;
pub mod key;
pub mod manifest;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::{FileCacheConfig, FileCacheConfigBuilder, resolve_cache_root};
pub use eviction::EvictionReport;
pub use file_cache::{CacheStats, FileCache};
pub use key::{CacheKey, filename_for_key};
pub use manifest::CacheEntry;
