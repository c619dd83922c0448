//! Time- and fingerprint-validated cache of remote directory catalogs.
//!
//! An entry is reused only while it is younger than the TTL *and* a cheap
//! probe of the remote manifest (size + mtime) still matches what was seen at
//! fetch time. When the remote cannot be reached, the last good snapshot is
//! served and flagged stale instead of failing the browse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NetworkCacheConfig;
use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::identity::{path_cache_key, CacheKey, DirectoryIdentityResolver, KeyOrigin};
use crate::manifest::{CatalogManifest, MANIFEST_FILE};
use crate::record::PhotoRecord;
use crate::shard::{CatalogShard, ShardIndex};
use crate::store::{
    load_catalog, write_atomic, CatalogReader, CatalogShardStore, LoadedCatalog, LocalDirectory,
};

/// Metadata of a remote file, obtainable without downloading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFingerprint {
    pub size_bytes: u64,
    pub modified_at: Option<SystemTime>,
}

/// A directory whose catalog files are expensive to read.
#[async_trait]
pub trait RemoteDirectory: CatalogReader {
    /// Size and modification time of a catalog file. `Ok(None)` if absent.
    async fn probe(&self, name: &str) -> Result<Option<SourceFingerprint>>;
}

#[async_trait]
impl RemoteDirectory for LocalDirectory {
    async fn probe(&self, name: &str) -> Result<Option<SourceFingerprint>> {
        let path = self.catalog_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(SourceFingerprint {
                size_bytes: meta.len(),
                modified_at: meta.modified().ok(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("failed to stat {}", path.display()), e)),
        }
    }
}

/// Read-only copy of a catalog as it was when fetched.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub manifest: CatalogManifest,
    records: Vec<PhotoRecord>,
    positions: HashMap<ContentHash, usize>,
    /// Shards that failed verification during the fetch.
    pub corrupted: Vec<ShardIndex>,
}

impl CatalogSnapshot {
    pub fn from_loaded(loaded: LoadedCatalog) -> Self {
        let mut shards = loaded.shards;
        shards.sort_by_key(|s| s.index);
        let records: Vec<PhotoRecord> = shards.into_iter().flat_map(|s| s.records).collect();
        let positions = records
            .iter()
            .enumerate()
            .map(|(pos, record)| (record.content_hash.clone(), pos))
            .collect();
        Self {
            manifest: loaded.manifest,
            records,
            positions,
            corrupted: loaded.corrupted.into_iter().map(|f| f.index).collect(),
        }
    }

    pub fn lookup(&self, hash: &ContentHash) -> Option<&PhotoRecord> {
        self.positions.get(hash).map(|&pos| &self.records[pos])
    }

    pub fn records(&self) -> &[PhotoRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn shards(&self) -> Vec<CatalogShard> {
        let mut shards: Vec<CatalogShard> = Vec::new();
        for record in &self.records {
            let index = record.content_hash.shard();
            match shards.last_mut() {
                Some(shard) if shard.index == index => shard.records.push(record.clone()),
                _ => shards.push(CatalogShard {
                    index,
                    records: vec![record.clone()],
                }),
            }
        }
        shards
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Served from memory after a matching probe.
    Cached,
    /// Just read from the remote.
    Fetched,
    /// The remote could not be checked; this may be out of date.
    Stale { reason: String },
}

#[derive(Debug, Clone)]
pub struct CachedCatalog {
    pub key: CacheKey,
    pub snapshot: Arc<CatalogSnapshot>,
    pub freshness: Freshness,
}

impl CachedCatalog {
    pub fn is_stale(&self) -> bool {
        matches!(self.freshness, Freshness::Stale { .. })
    }
}

#[derive(Debug, Clone)]
struct DirectoryCacheEntry {
    snapshot: Arc<CatalogSnapshot>,
    fetched_at: Instant,
    source_fingerprint: Option<SourceFingerprint>,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, DirectoryCacheEntry>,
    /// Directory reference → key of its last successful fetch, for when the
    /// manifest cannot be read to resolve the key again.
    aliases: HashMap<PathBuf, CacheKey>,
}

pub struct NetworkCatalogCache {
    config: NetworkCacheConfig,
    resolver: DirectoryIdentityResolver,
    state: Mutex<State>,
    fetches: AtomicU64,
}

impl NetworkCatalogCache {
    pub fn new(config: NetworkCacheConfig) -> Self {
        Self {
            config,
            resolver: DirectoryIdentityResolver::new(),
            state: Mutex::new(State::default()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &NetworkCacheConfig {
        &self.config
    }

    /// Return the directory's catalog, from memory when the cached entry is
    /// still valid, otherwise by fetching it.
    pub async fn get<R: RemoteDirectory + ?Sized>(&self, remote: &R) -> Result<CachedCatalog> {
        let key = self.resolve_key(remote).await;
        let existing = self.state.lock().entries.get(&key).cloned();

        let Some(entry) = existing else {
            return match self.fetch(remote).await {
                Ok(fetched) => Ok(fetched),
                Err(e) if e.is_transient() => match self.load_mirror(&key).await {
                    Some(snapshot) => {
                        warn!(
                            "Serving mirrored catalog for {}: {}",
                            remote.directory().display(),
                            e
                        );
                        Ok(CachedCatalog {
                            key,
                            snapshot,
                            freshness: Freshness::Stale {
                                reason: e.to_string(),
                            },
                        })
                    }
                    None => Err(e),
                },
                Err(e) => Err(e),
            };
        };

        if entry.fetched_at.elapsed() < self.config.ttl {
            match timeout(self.config.probe_timeout, remote.probe(MANIFEST_FILE)).await {
                Ok(Ok(fingerprint)) if fingerprint == entry.source_fingerprint => {
                    return Ok(CachedCatalog {
                        key,
                        snapshot: entry.snapshot,
                        freshness: Freshness::Cached,
                    });
                }
                Ok(Ok(_)) => debug!("Catalog of {} changed", remote.directory().display()),
                Ok(Err(e)) => return Ok(self.stale(remote.directory(), key, entry, e)),
                Err(_) => {
                    let e = Error::Timeout(self.config.probe_timeout);
                    return Ok(self.stale(remote.directory(), key, entry, e));
                }
            }
        }

        match self.fetch(remote).await {
            Ok(fetched) => Ok(fetched),
            Err(e) if e.is_transient() => Ok(self.stale(remote.directory(), key, entry, e)),
            Err(e) => {
                self.state.lock().entries.remove(&key);
                Err(e)
            }
        }
    }

    /// Drop any cached entry for the directory so the next `get` refetches.
    pub async fn invalidate<R: RemoteDirectory + ?Sized>(&self, remote: &R) {
        let key = self.resolve_key(remote).await;
        self.invalidate_key(&key);
    }

    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let removed = self.state.lock().entries.remove(key).is_some();
        if removed {
            info!("Invalidated cached catalog {}", key);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of full fetches performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn resolve_key<R: RemoteDirectory + ?Sized>(&self, remote: &R) -> CacheKey {
        let resolving = self.resolver.resolve(remote);
        let resolution = match timeout(self.config.probe_timeout, resolving).await {
            Ok(resolution) => resolution,
            Err(_) => {
                debug!("Timed out resolving {}", remote.directory().display());
                return self
                    .alias(remote.directory())
                    .unwrap_or(path_cache_key(remote.directory()).await);
            }
        };
        match resolution.origin {
            KeyOrigin::PathHashAfterReadError => {
                self.alias(remote.directory()).unwrap_or(resolution.key)
            }
            KeyOrigin::ManifestUuid | KeyOrigin::PathHash => resolution.key,
        }
    }

    fn alias(&self, directory: &Path) -> Option<CacheKey> {
        self.state.lock().aliases.get(directory).cloned()
    }

    fn stale(
        &self,
        directory: &Path,
        key: CacheKey,
        entry: DirectoryCacheEntry,
        error: Error,
    ) -> CachedCatalog {
        warn!(
            "Serving cached catalog for {} without revalidation: {}",
            directory.display(),
            error
        );
        CachedCatalog {
            key,
            snapshot: entry.snapshot,
            freshness: Freshness::Stale {
                reason: error.to_string(),
            },
        }
    }

    async fn fetch<R: RemoteDirectory + ?Sized>(&self, remote: &R) -> Result<CachedCatalog> {
        let probe_timeout = self.config.probe_timeout;
        let fetch_timeout = self.config.fetch_timeout;

        let source_fingerprint = timeout(probe_timeout, remote.probe(MANIFEST_FILE))
            .await
            .map_err(|_| Error::Timeout(probe_timeout))??;
        let loaded = timeout(fetch_timeout, load_catalog(remote))
            .await
            .map_err(|_| Error::Timeout(fetch_timeout))??;
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let key = CacheKey::DirectoryUuid(loaded.manifest.directory_uuid);
        let snapshot = Arc::new(CatalogSnapshot::from_loaded(loaded));
        debug!(
            "Fetched {} records for {} ({})",
            snapshot.len(),
            remote.directory().display(),
            key
        );

        if let Some(root) = &self.config.mirror_root {
            if let Err(e) = self.write_mirror(root, remote.directory(), &key, &snapshot).await {
                warn!("Failed to mirror catalog {}: {}", key, e);
            }
        }

        {
            let mut state = self.state.lock();
            state.entries.insert(
                key.clone(),
                DirectoryCacheEntry {
                    snapshot: snapshot.clone(),
                    fetched_at: Instant::now(),
                    source_fingerprint,
                },
            );
            state
                .aliases
                .insert(remote.directory().to_path_buf(), key.clone());
        }

        Ok(CachedCatalog {
            key,
            snapshot,
            freshness: Freshness::Fetched,
        })
    }

    async fn write_mirror(
        &self,
        root: &Path,
        directory: &Path,
        key: &CacheKey,
        snapshot: &CatalogSnapshot,
    ) -> Result<()> {
        let store = CatalogShardStore::new(root.join(key.as_file_stem()));
        store.write(&snapshot.manifest, &snapshot.shards()).await?;

        let alias_stem = path_cache_key(directory).await.as_file_stem();
        let alias_path = root.join(format!("{}.alias", alias_stem));
        let stem = key.as_file_stem();
        tokio::task::spawn_blocking(move || write_atomic(&alias_path, stem.as_bytes()))
            .await
            .map_err(|e| Error::io("mirror alias task failed", std::io::Error::other(e)))?
    }

    async fn load_mirror(&self, key: &CacheKey) -> Option<Arc<CatalogSnapshot>> {
        let root = self.config.mirror_root.as_ref()?;
        let stem = match key {
            CacheKey::DirectoryUuid(_) => key.as_file_stem(),
            CacheKey::PathHash(_) => {
                let alias = root.join(format!("{}.alias", key.as_file_stem()));
                let bytes = tokio::fs::read(&alias).await.ok()?;
                String::from_utf8(bytes).ok()?.trim().to_string()
            }
        };

        match CatalogShardStore::new(root.join(&stem)).load().await {
            Ok(loaded) => Some(Arc::new(CatalogSnapshot::from_loaded(loaded))),
            Err(e) => {
                debug!("No usable mirror {}: {}", stem, e);
                None
            }
        }
    }
}
