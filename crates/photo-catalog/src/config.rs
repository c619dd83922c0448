use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`NetworkCatalogCache`](crate::NetworkCatalogCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCacheConfig {
    /// Hard upper bound on how long a fetched snapshot is reused.
    pub ttl: Duration,
    /// Deadline for the cheap manifest probe.
    pub probe_timeout: Duration,
    /// Deadline for a full manifest + shards fetch.
    pub fetch_timeout: Duration,
    /// Local directory that keeps a copy of every fetched catalog, served when
    /// the remote is unreachable and nothing is cached in memory.
    pub mirror_root: Option<PathBuf>,
}

impl Default for NetworkCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(30),
            mirror_root: None,
        }
    }
}

impl NetworkCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_mirror(mut self, root: impl Into<PathBuf>) -> Self {
        self.mirror_root = Some(root.into());
        self
    }
}
