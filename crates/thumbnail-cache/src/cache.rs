//! Two-tier, content-addressed thumbnail cache
//!
//! Lookup order is memory, then disk, then generation. Per key the lifecycle
//! is `Absent → Generating → Cached`; concurrent requests for a key that is
//! generating share that one generation. The memory LRU and the in-flight
//! registry sit behind a single lock. Generation itself runs on the blocking
//! pool behind a semaphore so decode/encode work stays bounded.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use image::ImageReader;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::generate::{PolicyGenerator, ThumbnailGenerator, ThumbnailWarning};
use crate::key::ThumbnailCacheKey;
use crate::memory::MemoryCache;
use crate::ThumbnailConfig;

/// Where to read the source image from on a cache miss.
#[derive(Debug, Clone)]
pub enum ThumbnailSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl From<PathBuf> for ThumbnailSource {
    fn from(path: PathBuf) -> Self {
        ThumbnailSource::Path(path)
    }
}

impl From<Vec<u8>> for ThumbnailSource {
    fn from(bytes: Vec<u8>) -> Self {
        ThumbnailSource::Bytes(bytes.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailArtifact {
    pub key: ThumbnailCacheKey,
    pub bytes: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub target_short_edge: u32,
    pub warning: Option<ThumbnailWarning>,
}

impl ThumbnailArtifact {
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_items: usize,
    pub memory_bytes: usize,
    pub memory_budget_bytes: usize,
    pub in_flight: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub generated: u64,
    pub failed: u64,
}

impl CacheStats {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_budget_bytes == 0 {
            0.0
        } else {
            (self.memory_bytes as f64 / self.memory_budget_bytes as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimSummary {
    pub files_removed: usize,
    pub bytes_removed: u64,
    pub bytes_remaining: u64,
}

type Generation = Shared<BoxFuture<'static, Result<ThumbnailArtifact>>>;

struct InFlight {
    id: u64,
    generation: WeakShared<BoxFuture<'static, Result<ThumbnailArtifact>>>,
}

struct State {
    memory: MemoryCache<ThumbnailCacheKey, ThumbnailArtifact>,
    in_flight: HashMap<ThumbnailCacheKey, InFlight>,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    generated: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    config: ThumbnailConfig,
    generator: Arc<dyn ThumbnailGenerator>,
    state: Mutex<State>,
    permits: Arc<Semaphore>,
    counters: Counters,
    next_id: AtomicU64,
}

/// Removes a registry entry when its generation finishes or is dropped.
struct RegistryGuard {
    inner: Arc<Inner>,
    key: ThumbnailCacheKey,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.in_flight.get(&self.key).map(|f| f.id) == Some(self.id) {
            state.in_flight.remove(&self.key);
        }
    }
}

/// Process-wide thumbnail cache. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ThumbnailCacheEngine {
    inner: Arc<Inner>,
}

impl ThumbnailCacheEngine {
    pub fn new(config: ThumbnailConfig) -> Self {
        let generator = PolicyGenerator::new(config.policy);
        Self::with_generator(config, generator)
    }

    pub fn with_generator(config: ThumbnailConfig, generator: impl ThumbnailGenerator) -> Self {
        let memory = MemoryCache::new(config.memory_entries, config.memory_budget_bytes);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_generations.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                generator: Arc::new(generator),
                state: Mutex::new(State {
                    memory,
                    in_flight: HashMap::new(),
                }),
                permits,
                counters: Counters::default(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.inner.config
    }

    pub fn disk_path(&self, key: &ThumbnailCacheKey) -> PathBuf {
        key.disk_path(&self.inner.config.cache_root)
    }

    /// Get a thumbnail, generating it if neither tier has it.
    ///
    /// Dropping the returned future abandons interest; the generation is
    /// only discarded once every requester of the key has done so.
    pub async fn get(
        &self,
        key: ThumbnailCacheKey,
        source: ThumbnailSource,
    ) -> Result<ThumbnailArtifact> {
        let generation: Generation = {
            let mut state = self.inner.state.lock();
            if let Some(hit) = state.memory.get(&key) {
                self.inner.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }

            let pending = state
                .in_flight
                .get(&key)
                .and_then(|in_flight| in_flight.generation.upgrade());
            match pending {
                Some(generation) => {
                    debug!("Joining in-flight generation for {}", key);
                    generation
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let generation = load_or_generate(self.inner.clone(), key.clone(), source, id)
                        .boxed()
                        .shared();
                    if let Some(weak) = generation.downgrade() {
                        state.in_flight.insert(
                            key,
                            InFlight {
                                id,
                                generation: weak,
                            },
                        );
                    }
                    generation
                }
            }
        };

        generation.await
    }

    /// Whether either tier holds the key. Never generates.
    pub async fn has_thumbnail(&self, key: &ThumbnailCacheKey) -> bool {
        if self.inner.state.lock().memory.contains(key) {
            return true;
        }
        tokio::fs::try_exists(self.disk_path(key))
            .await
            .unwrap_or(false)
    }

    /// Drop the memory tier and delete every cached file.
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.state.lock().memory.clear();

        for kind in ThumbnailCacheKey::KIND_DIRS {
            let dir = self.inner.config.cache_root.join(kind);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("failed to remove {}", dir.display()), e)),
            }
        }
        Ok(())
    }

    /// Delete cached files, oldest first, until the disk tier fits `max_bytes`.
    pub async fn trim_disk(&self, max_bytes: u64) -> Result<TrimSummary> {
        let root = self.inner.config.cache_root.clone();
        tokio::task::spawn_blocking(move || trim_dir(&root, max_bytes))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        CacheStats {
            memory_items: state.memory.len(),
            memory_bytes: state.memory.total_bytes(),
            memory_budget_bytes: state.memory.max_bytes(),
            in_flight: state.in_flight.len(),
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            generated: counters.generated.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn load_or_generate(
    inner: Arc<Inner>,
    key: ThumbnailCacheKey,
    source: ThumbnailSource,
    id: u64,
) -> Result<ThumbnailArtifact> {
    let _guard = RegistryGuard {
        inner: inner.clone(),
        key: key.clone(),
        id,
    };
    let path = key.disk_path(&inner.config.cache_root);

    if let Some(artifact) = read_disk(&inner, &key, &path).await {
        inner.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        remember(&inner, &artifact);
        return Ok(artifact);
    }

    match generate(&inner, &key, source, path).await {
        Ok(artifact) => {
            inner.counters.generated.fetch_add(1, Ordering::Relaxed);
            remember(&inner, &artifact);
            Ok(artifact)
        }
        Err(e) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to generate thumbnail for {}: {}", key, e);
            Err(e)
        }
    }
}

fn remember(inner: &Inner, artifact: &ThumbnailArtifact) {
    inner.state.lock().memory.insert(
        artifact.key.clone(),
        artifact.clone(),
        artifact.byte_size(),
    );
}

async fn read_disk(
    inner: &Inner,
    key: &ThumbnailCacheKey,
    path: &Path,
) -> Option<ThumbnailArtifact> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read cached thumbnail {}: {}", path.display(), e);
            return None;
        }
    };

    let dimensions = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(image::ImageError::from)
        .and_then(|reader| reader.into_dimensions());
    let (width, height) = match dimensions {
        Ok(dimensions) => dimensions,
        Err(e) => {
            warn!("Discarding corrupt cached thumbnail {}: {}", path.display(), e);
            let _ = tokio::fs::remove_file(path).await;
            return None;
        }
    };

    let max_bytes = inner.config.policy.max_encoded_bytes;
    let warning = (bytes.len() > max_bytes).then_some(ThumbnailWarning::SizeLimitExceeded {
        encoded_bytes: bytes.len(),
        max_bytes,
    });
    Some(ThumbnailArtifact {
        key: key.clone(),
        bytes: bytes.into(),
        width,
        height,
        target_short_edge: inner.generator.target_short_edge(),
        warning,
    })
}

async fn generate(
    inner: &Inner,
    key: &ThumbnailCacheKey,
    source: ThumbnailSource,
    path: PathBuf,
) -> Result<ThumbnailArtifact> {
    let permit = inner
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| Error::Task(e.to_string()))?;

    let source_bytes: Arc<[u8]> = match source {
        ThumbnailSource::Bytes(bytes) => bytes,
        ThumbnailSource::Path(source_path) => match tokio::fs::read(&source_path).await {
            Ok(bytes) => bytes.into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InvalidSource(format!(
                    "{} does not exist",
                    source_path.display()
                )));
            }
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read {}", source_path.display()),
                    e,
                ))
            }
        },
    };

    let generator = inner.generator.clone();
    let generated = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let generated = generator.generate(&source_bytes)?;
        if let Err(e) = persist(&path, &generated.bytes) {
            warn!("Failed to write thumbnail {}: {}", path.display(), e);
        }
        Ok::<_, Error>(generated)
    })
    .await
    .map_err(|e| Error::Task(e.to_string()))??;

    debug!(
        "Generated {} ({}x{}, {} bytes, quality {})",
        key,
        generated.width,
        generated.height,
        generated.bytes.len(),
        generated.quality
    );

    Ok(ThumbnailArtifact {
        key: key.clone(),
        bytes: generated.bytes.into(),
        width: generated.width,
        height: generated.height,
        target_short_edge: inner.generator.target_short_edge(),
        warning: generated.warning,
    })
}

fn persist(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    photo_catalog::write_atomic(path, bytes)?;
    Ok(())
}

fn trim_dir(root: &Path, max_bytes: u64) -> Result<TrimSummary> {
    let mut files: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
    for kind in ThumbnailCacheKey::KIND_DIRS {
        let dir = root.join(kind);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(format!("failed to list {}", dir.display()), e)),
        };
        for entry in entries.flatten() {
            // In-progress atomic writes
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, meta.len(), entry.path()));
        }
    }

    files.sort();
    let mut summary = TrimSummary {
        bytes_remaining: files.iter().map(|(_, len, _)| len).sum(),
        ..Default::default()
    };

    for (_, len, path) in files {
        if summary.bytes_remaining <= max_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                summary.files_removed += 1;
                summary.bytes_removed += len;
                summary.bytes_remaining -= len;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    debug!(
        "Trimmed {} files ({} bytes) from {}",
        summary.files_removed,
        summary.bytes_removed,
        root.display()
    );
    Ok(summary)
}
