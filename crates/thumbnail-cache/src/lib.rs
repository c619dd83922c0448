//! Content-addressed thumbnail cache for Photolala
//!
//! Thumbnails are derived under one fixed policy (256 px short edge, 512 px
//! long-edge clamp, byte-budgeted JPEG) so the same source bytes produce the
//! same thumbnail on every device. They are cached in memory (true LRU) and on
//! disk under `<cache-root>/<key-kind>/<key>.jpg`.
//!
//! # Features
//!
//! - **Deterministic derivation**: face-biased portrait crops, quality stepping under a byte cap
//! - **Dual caching**: memory LRU with entry and byte budgets + persistent disk cache
//! - **Request coalescing**: one generation per key no matter how many callers wait
//! - **Bounded generation**: decode/encode runs on the blocking pool behind a semaphore
//! - **Smart prefetching**: viewport-aware scheduling with cancellation

pub mod cache;
pub mod error;
pub mod generate;
pub mod key;
pub mod memory;
pub mod prefetch;

pub use cache::{
    CacheStats, ThumbnailArtifact, ThumbnailCacheEngine, ThumbnailSource, TrimSummary,
};
pub use error::{Error, Result};
pub use generate::{
    generate_thumbnail, plan_crop, CropPlan, GeneratedThumbnail, PolicyGenerator,
    ThumbnailGenerator, ThumbnailPolicy, ThumbnailWarning,
};
pub use key::ThumbnailCacheKey;
pub use memory::MemoryCache;
pub use prefetch::{PrefetchJob, PrefetchProgress, PrefetchRequest, PrefetchScheduler};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the Photolala cache directory.
pub const CACHE_DIR_ENV: &str = "PHOTOLALA_CACHE_DIR";

/// Standard configuration for the thumbnail cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    pub cache_root: PathBuf,
    pub memory_entries: usize,
    pub memory_budget_bytes: usize,
    pub max_concurrent_generations: usize,
    pub policy: ThumbnailPolicy,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            memory_entries: 300,
            memory_budget_bytes: 64 * 1024 * 1024, // 64MB
            max_concurrent_generations: 4,
            policy: ThumbnailPolicy::default(),
        }
    }
}

impl ThumbnailConfig {
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }
}

/// `$PHOTOLALA_CACHE_DIR/thumbnails`, else the platform cache directory.
pub fn default_cache_root() -> PathBuf {
    let base = match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("photolala"),
    };
    base.join("thumbnails")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThumbnailConfig::default();
        assert_eq!(config.memory_entries, 300);
        assert_eq!(config.max_concurrent_generations, 4);
        assert_eq!(config.policy.short_edge, 256);
        assert_eq!(config.policy.long_edge_max, 512);
        assert_eq!(config.policy.max_encoded_bytes, 50_000);
        assert!(config.cache_root.ends_with("thumbnails"));
    }

    #[test]
    fn test_config_with_cache_root() {
        let config = ThumbnailConfig::with_cache_root("/tmp/thumbs");
        assert_eq!(config.cache_root, PathBuf::from("/tmp/thumbs"));
        assert_eq!(config.memory_entries, 300);
    }
}
