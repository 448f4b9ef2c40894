//! File cache configuration and cache directory resolution

use crate::eviction::DEFAULT_EVICTION_RATIO;
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use std::path::{Path, PathBuf};

/// Default upper bound on cached bytes (500 MiB)
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 500 * 1024 * 1024;

/// Environment variable that overrides the cache directory
pub const CACHE_DIR_ENV: &str = "SIDECHAIN_CACHE_DIR";

/// Settings for a [`FileCache`](crate::FileCache)
#[derive(Debug, Clone, PartialEq)]
pub struct FileCacheConfig {
    directory: PathBuf,
    max_size_bytes: u64,
    eviction_ratio: f64,
}

impl FileCacheConfig {
    /// Configuration for `directory` with default limits
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            eviction_ratio: DEFAULT_EVICTION_RATIO,
        }
    }

    /// Start a builder
    #[must_use]
    pub fn builder() -> FileCacheConfigBuilder {
        FileCacheConfigBuilder::new()
    }

    /// Copy of this configuration with a different directory
    #[must_use]
    pub fn with_directory(&self, directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..self.clone()
        }
    }

    /// Copy of this configuration with a different size limit
    #[must_use]
    pub fn with_max_size_bytes(&self, max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            ..self.clone()
        }
    }

    /// Copy of this configuration with a different eviction ratio
    #[must_use]
    pub fn with_eviction_ratio(&self, eviction_ratio: f64) -> Self {
        Self {
            eviction_ratio,
            ..self.clone()
        }
    }

    /// Directory holding cached files and the manifest
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Maximum number of cached bytes before eviction kicks in
    #[must_use]
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Fraction of the maximum that eviction trims down to
    #[must_use]
    pub fn eviction_ratio(&self) -> f64 {
        self.eviction_ratio
    }

    /// Check the limits are usable
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the size limit is zero, the ratio is
    /// outside `(0, 1]`, or the directory is empty
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(Error::configuration("Cache directory must not be empty"));
        }
        if self.max_size_bytes == 0 {
            return Err(Error::configuration("Maximum cache size must be non-zero"));
        }
        if !(self.eviction_ratio > 0.0 && self.eviction_ratio <= 1.0) {
            return Err(Error::configuration(format!(
                "Eviction ratio must be in (0, 1], got {}",
                self.eviction_ratio
            )));
        }
        Ok(())
    }
}

/// Builder for [`FileCacheConfig`]
#[derive(Debug, Clone, Default)]
pub struct FileCacheConfigBuilder {
    directory: Option<PathBuf>,
    max_size_bytes: Option<u64>,
    eviction_ratio: Option<f64>,
}

impl FileCacheConfigBuilder {
    /// Creates a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory (resolved from the environment if unset)
    #[must_use]
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Set the maximum cache size in bytes
    #[must_use]
    pub fn max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = Some(bytes);
        self
    }

    /// Set the fraction of the maximum that eviction trims down to
    #[must_use]
    pub fn eviction_ratio(mut self, ratio: f64) -> Self {
        self.eviction_ratio = Some(ratio);
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if no cache directory can be resolved or the limits
    /// are invalid
    pub fn build(self) -> Result<FileCacheConfig> {
        let directory = match self.directory {
            Some(dir) => dir,
            None => resolve_cache_root()?,
        };
        let config = FileCacheConfig {
            directory,
            max_size_bytes: self.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE_BYTES),
            eviction_ratio: self.eviction_ratio.unwrap_or(DEFAULT_EVICTION_RATIO),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Inputs for determining cache root directory
#[derive(Debug, Clone)]
struct CacheInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) SIDECHAIN_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/sidechain/files
    // 3) OS cache dir/sidechain/files
    // 4) ~/.sidechain/cache/files
    // 5) TMPDIR/sidechain/cache/files (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.override_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("sidechain/files"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("sidechain/files"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".sidechain/cache/files"));
    }
    candidates.push(inputs.temp_dir.join("sidechain/cache/files"));

    for path in candidates {
        // Existing directories may be read-only (shared CI homes, sandboxes)
        if path.exists() {
            let probe = path.join(".write_probe");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
                .is_ok()
            {
                let _ = std::fs::remove_file(&probe);
                return Ok(path);
            }
            tracing::debug!(path = %path.display(), "Cache candidate not writable, skipping");
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the default cache directory from the environment
///
/// # Errors
///
/// Returns a configuration error if no candidate directory is writable
pub fn resolve_cache_root() -> Result<PathBuf> {
    let env_path = |name: &str| {
        std::env::var(name)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
    };
    let inputs = CacheInputs {
        override_dir: env_path(CACHE_DIR_ENV),
        xdg_cache_home: env_path("XDG_CACHE_HOME"),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}
