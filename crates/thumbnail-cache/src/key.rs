use std::fmt;
use std::path::{Path, PathBuf};

use photo_catalog::ContentHash;
use serde::{Deserialize, Serialize};

/// Extension of every file in the disk cache.
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// What a cached thumbnail is addressed by.
///
/// Content-hash keys are shared by every directory and machine that sees the
/// same bytes. Platform-local identifiers only mean something on one device,
/// so they live in their own namespace and never collide with content keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ThumbnailCacheKey {
    ContentHash(ContentHash),
    PlatformLocalId(String),
}

impl ThumbnailCacheKey {
    /// Every subdirectory of the disk cache, one per key kind.
    pub const KIND_DIRS: [&'static str; 2] = ["content", "local"];

    /// Name of the disk cache subdirectory for this kind of key.
    pub fn kind_dir(&self) -> &'static str {
        match self {
            ThumbnailCacheKey::ContentHash(_) => "content",
            ThumbnailCacheKey::PlatformLocalId(_) => "local",
        }
    }

    /// File stem under [`kind_dir`](Self::kind_dir). Local identifiers are
    /// percent-encoded so any string maps to exactly one safe file name.
    pub fn file_stem(&self) -> String {
        match self {
            ThumbnailCacheKey::ContentHash(hash) => hash.to_string(),
            ThumbnailCacheKey::PlatformLocalId(id) => urlencoding::encode(id).into_owned(),
        }
    }

    /// `<root>/<kind>/<value>.jpg`
    pub fn disk_path(&self, root: &Path) -> PathBuf {
        root.join(self.kind_dir())
            .join(format!("{}.{}", self.file_stem(), THUMBNAIL_EXTENSION))
    }
}

impl From<ContentHash> for ThumbnailCacheKey {
    fn from(hash: ContentHash) -> Self {
        ThumbnailCacheKey::ContentHash(hash)
    }
}

impl fmt::Display for ThumbnailCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_dir(), self.file_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photo_catalog::hash_bytes;

    #[test]
    fn test_kinds_use_separate_namespaces() {
        let hash = hash_bytes(b"pixels");
        let content = ThumbnailCacheKey::ContentHash(hash.clone());
        let local = ThumbnailCacheKey::PlatformLocalId(hash.to_string());

        let root = Path::new("/cache");
        assert_ne!(content.disk_path(root), local.disk_path(root));
        assert_eq!(
            content.disk_path(root),
            root.join("content").join(format!("{}.jpg", hash))
        );
    }

    #[test]
    fn test_local_ids_are_path_safe() {
        let key = ThumbnailCacheKey::PlatformLocalId("ABC/123 L0/001".to_string());
        let stem = key.file_stem();
        assert!(!stem.contains('/'));
        assert_eq!(key.disk_path(Path::new("/c")).parent(), Some(Path::new("/c/local")));
    }
}
