//! Durable storage of one directory's catalog.
//!
//! Layout:
//!
//! ```text
//! <directory>/.photolala/
//!     manifest    # CatalogManifest (JSON)
//!     0 .. f      # one shard file per routing nibble
//! ```
//!
//! Reads go through [`CatalogReader`] so local and network directories share
//! one load path. Writes are local only and follow write-temp-then-rename for
//! every file, with the manifest written last.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manifest::{CatalogManifest, CATALOG_DIR, MANIFEST_FILE};
use crate::shard::{shard_checksum, CatalogShard, ShardIndex};

/// Read access to the files of a catalog directory.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// The directory as the caller referenced it.
    fn directory(&self) -> &Path;

    /// Read a file from the directory's catalog subdirectory. `Ok(None)` means
    /// the file does not exist.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// A directory reachable through the local filesystem (including mounted
/// network shares).
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    root: PathBuf,
}

impl LocalDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn catalog_path(&self, name: &str) -> PathBuf {
        self.root.join(CATALOG_DIR).join(name)
    }
}

#[async_trait]
impl CatalogReader for LocalDirectory {
    fn directory(&self) -> &Path {
        &self.root
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.catalog_path(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("failed to read {}", path.display()), e)),
        }
    }
}

/// A shard that could not be used. Only this shard needs rebuilding.
#[derive(Debug, Clone)]
pub struct ShardFault {
    pub index: ShardIndex,
    pub error: Error,
}

/// Result of loading a catalog: the manifest, every shard that verified, and
/// the shards that did not.
#[derive(Debug, Clone)]
pub struct LoadedCatalog {
    pub manifest: CatalogManifest,
    pub shards: Vec<CatalogShard>,
    pub corrupted: Vec<ShardFault>,
}

impl LoadedCatalog {
    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.records.len()).sum()
    }
}

pub async fn load_manifest<R: CatalogReader + ?Sized>(reader: &R) -> Result<CatalogManifest> {
    let bytes = reader
        .read(MANIFEST_FILE)
        .await?
        .ok_or_else(|| Error::NotFound(reader.directory().to_path_buf()))?;
    CatalogManifest::decode(&bytes)
}

/// Load the manifest and every shard it lists.
pub async fn load_catalog<R: CatalogReader + ?Sized>(reader: &R) -> Result<LoadedCatalog> {
    let manifest = load_manifest(reader).await?;
    let listed = manifest.listed_shards();
    load_shards(reader, manifest, &listed).await
}

/// Load a subset of shards, e.g. only those covering a hash range of a very
/// large catalog. Shards the manifest does not list are skipped.
pub async fn load_shards<R: CatalogReader + ?Sized>(
    reader: &R,
    manifest: CatalogManifest,
    indices: &[ShardIndex],
) -> Result<LoadedCatalog> {
    let wanted: Vec<ShardIndex> = indices
        .iter()
        .copied()
        .filter(|index| manifest.checksum(*index).is_some())
        .collect();

    let reads = wanted.iter().map(|&index| async move {
        let bytes = reader.read(&index.file_name()).await;
        (index, bytes)
    });
    let mut fetched = Vec::with_capacity(wanted.len());
    for (index, bytes) in futures::future::join_all(reads).await {
        fetched.push((index, bytes?));
    }

    let manifest_for_verify = manifest.clone();
    let verified: Vec<(ShardIndex, Result<CatalogShard>)> = tokio::task::spawn_blocking(move || {
        fetched
            .into_par_iter()
            .map(|(index, bytes)| {
                let shard = verify_shard(&manifest_for_verify, index, bytes);
                (index, shard)
            })
            .collect()
    })
    .await
    .map_err(|e| Error::io("shard verification task failed", std::io::Error::other(e)))?;

    let mut shards = Vec::new();
    let mut corrupted = Vec::new();
    for (index, result) in verified {
        match result {
            Ok(shard) => shards.push(shard),
            Err(error) => {
                warn!(
                    "Isolating shard {} of {}: {}",
                    index,
                    reader.directory().display(),
                    error
                );
                corrupted.push(ShardFault { index, error });
            }
        }
    }

    debug!(
        "Loaded {} shards ({} corrupted) from {}",
        shards.len(),
        corrupted.len(),
        reader.directory().display()
    );

    Ok(LoadedCatalog {
        manifest,
        shards,
        corrupted,
    })
}

fn verify_shard(
    manifest: &CatalogManifest,
    index: ShardIndex,
    bytes: Option<Vec<u8>>,
) -> Result<CatalogShard> {
    let corrupted = |reason: String| Error::Corrupted {
        shard: index.file_name(),
        reason,
    };

    let bytes = bytes.ok_or_else(|| corrupted("listed in manifest but missing".to_string()))?;
    let expected = manifest
        .checksum(index)
        .ok_or_else(|| corrupted("not listed in manifest".to_string()))?;
    let actual = shard_checksum(&bytes);
    if actual != expected {
        return Err(corrupted(format!(
            "checksum mismatch (manifest {}, file {})",
            expected, actual
        )));
    }
    CatalogShard::decode(index, &bytes)
}

/// Write `bytes` to `path` through a temporary file in the same directory,
/// then rename it into place. Readers see the old file or the new one, never a
/// partial write.
///
/// The file gets the same permissions a plain create would (0644 under the
/// umask on unix), so catalogs on shared volumes stay readable to other users.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    let mut tmp = builder.tempfile_in(parent).map_err(|e| {
        Error::io(
            format!("failed to create temp file in {}", parent.display()),
            e,
        )
    })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write temp file for {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to replace {}", path.display()), e.error))?;
    Ok(())
}

/// Reads and writes the catalog of one local directory.
///
/// Writers to the same directory must be serialized by the caller.
#[derive(Debug, Clone)]
pub struct CatalogShardStore {
    directory: LocalDirectory,
}

impl CatalogShardStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: LocalDirectory::new(directory),
        }
    }

    pub fn directory(&self) -> &Path {
        self.directory.directory()
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.directory().join(CATALOG_DIR)
    }

    pub fn reader(&self) -> &LocalDirectory {
        &self.directory
    }

    pub async fn load(&self) -> Result<LoadedCatalog> {
        load_catalog(&self.directory).await
    }

    pub async fn load_shards(&self, indices: &[ShardIndex]) -> Result<LoadedCatalog> {
        let manifest = load_manifest(&self.directory).await?;
        load_shards(&self.directory, manifest, indices).await
    }

    /// Persist `shards` and a manifest naming their new checksums.
    ///
    /// Each shard is replaced atomically, then the manifest is replaced last.
    /// Returns the manifest that was committed; `manifest` itself is left
    /// untouched so a failed write changes nothing in the caller's view.
    pub async fn write(
        &self,
        manifest: &CatalogManifest,
        shards: &[CatalogShard],
    ) -> Result<CatalogManifest> {
        let mut committed = manifest.clone();
        let encoded: Vec<(ShardIndex, Vec<u8>)> =
            shards.iter().map(|s| (s.index, s.encode())).collect();
        for (index, bytes) in &encoded {
            committed.set_checksum(*index, shard_checksum(bytes));
        }
        committed.last_updated = Utc::now();
        let manifest_bytes = committed.encode()?;

        let dir = self.catalog_dir();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
            for (index, bytes) in &encoded {
                write_atomic(&dir.join(index.file_name()), bytes)?;
            }
            write_atomic(&dir.join(MANIFEST_FILE), &manifest_bytes)
        })
        .await
        .map_err(|e| Error::io("catalog write task failed", std::io::Error::other(e)))??;

        debug!(
            "Committed {} shards to {}",
            shards.len(),
            self.directory().display()
        );
        Ok(committed)
    }
}
