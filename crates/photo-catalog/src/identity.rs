//! Stable cache keys for directories that may be reachable by several paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::manifest::{CatalogManifest, MANIFEST_FILE};
use crate::store::{CatalogReader, LocalDirectory};

/// Identity of a directory for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    /// The UUID embedded in the directory's catalog manifest.
    DirectoryUuid(Uuid),
    /// Hash of the canonical path, for directories without a catalog.
    PathHash(String),
}

impl CacheKey {
    /// A name usable as a file or directory name in a local cache store.
    pub fn as_file_stem(&self) -> String {
        match self {
            CacheKey::DirectoryUuid(uuid) => format!("uuid-{}", uuid.as_hyphenated()),
            CacheKey::PathHash(hash) => format!("path-{}", hash),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_file_stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    ManifestUuid,
    /// No manifest exists yet.
    PathHash,
    /// A manifest may exist but could not be read.
    PathHashAfterReadError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: CacheKey,
    pub origin: KeyOrigin,
}

/// Maps a directory reference to a [`CacheKey`], preferring the manifest's
/// directory UUID over a path hash.
///
/// Results are only good for the current access: a directory keyed by path
/// today is keyed by UUID once a catalog is written into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryIdentityResolver;

impl DirectoryIdentityResolver {
    pub fn new() -> Self {
        Self
    }

    pub async fn resolve<R: CatalogReader + ?Sized>(&self, reader: &R) -> Resolution {
        match reader.read(MANIFEST_FILE).await {
            Ok(Some(bytes)) => match CatalogManifest::peek_directory_uuid(&bytes) {
                Some(uuid) => Resolution {
                    key: CacheKey::DirectoryUuid(uuid),
                    origin: KeyOrigin::ManifestUuid,
                },
                None => {
                    debug!(
                        "Manifest in {} has no usable directory UUID",
                        reader.directory().display()
                    );
                    self.fallback(reader.directory(), KeyOrigin::PathHash).await
                }
            },
            Ok(None) => self.fallback(reader.directory(), KeyOrigin::PathHash).await,
            Err(e) => {
                debug!(
                    "Could not read manifest of {}: {}",
                    reader.directory().display(),
                    e
                );
                self.fallback(reader.directory(), KeyOrigin::PathHashAfterReadError)
                    .await
            }
        }
    }

    pub async fn resolve_path(&self, directory: &Path) -> Resolution {
        self.resolve(&LocalDirectory::new(directory)).await
    }

    async fn fallback(&self, directory: &Path, origin: KeyOrigin) -> Resolution {
        Resolution {
            key: path_cache_key(directory).await,
            origin,
        }
    }
}

/// Path-derived key: SHA-256 over the canonical path, truncated to 16 bytes.
/// Paths that cannot be canonicalized (e.g. an unreachable share) are hashed
/// as given.
pub async fn path_cache_key(directory: &Path) -> CacheKey {
    let canonical: PathBuf = tokio::fs::canonicalize(directory)
        .await
        .unwrap_or_else(|_| directory.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    CacheKey::PathHash(hex::encode(&digest[..16]))
}
