//! Catalog a small directory, then view every photo through the thumbnail cache.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use photo_catalog::{hash_file, DirectoryCatalogIndex, DirectoryEntry, FileDetails};
use thumbnail_cache::{
    GeneratedThumbnail, ThumbnailCacheEngine, ThumbnailCacheKey, ThumbnailConfig,
    ThumbnailGenerator, ThumbnailSource,
};

/// The fixtures are not real images; emit a solid tile per distinct source.
#[derive(Clone, Default)]
struct SolidTile {
    calls: Arc<AtomicUsize>,
}

impl ThumbnailGenerator for SolidTile {
    fn generate(&self, source: &[u8]) -> thumbnail_cache::Result<GeneratedThumbnail> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let shade = source.first().copied().unwrap_or(0).wrapping_mul(60);
        let rgb = RgbImage::from_pixel(256, 256, Rgb([shade, shade, shade]));
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, 85)
            .encode_image(&rgb)
            .unwrap();
        Ok(GeneratedThumbnail {
            bytes,
            width: 256,
            height: 256,
            quality: 85,
            warning: None,
        })
    }

    fn target_short_edge(&self) -> u32 {
        256
    }
}

fn list(dir: &Path) -> Vec<DirectoryEntry> {
    let mut entries: Vec<DirectoryEntry> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().unwrap().is_file())
        .map(|e| {
            let meta = e.metadata().unwrap();
            DirectoryEntry {
                path: e.path(),
                size_bytes: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            }
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

#[tokio::test]
async fn test_duplicate_files_share_record_and_thumbnail() {
    let photos = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();

    fs::write(photos.path().join("a.jpg"), [1u8; 10]).unwrap();
    fs::write(photos.path().join("b.jpg"), [2u8; 20]).unwrap();
    fs::write(photos.path().join("c.jpg"), [1u8; 10]).unwrap();

    let mut index = DirectoryCatalogIndex::open_or_create(photos.path())
        .await
        .unwrap();
    let summary = index.reconcile(&list(photos.path()), |path: &Path| {
        hash_file(path).map(FileDetails::new)
    });
    assert_eq!(summary.scanned, 3);
    index.flush().await.unwrap();

    let catalog = DirectoryCatalogIndex::open(photos.path()).await.unwrap();
    assert_eq!(catalog.len(), 2);
    let mut sizes: Vec<u64> = catalog.all_records().map(|r| r.size_bytes).collect();
    sizes.sort();
    assert_eq!(sizes, vec![10, 20]);

    let generator = SolidTile::default();
    let engine = ThumbnailCacheEngine::with_generator(
        ThumbnailConfig::with_cache_root(cache_root.path()),
        generator.clone(),
    );

    let mut viewed = Vec::new();
    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        let path = photos.path().join(name);
        let key = ThumbnailCacheKey::ContentHash(hash_file(&path).unwrap());
        assert!(catalog
            .lookup(match &key {
                ThumbnailCacheKey::ContentHash(hash) => hash,
                ThumbnailCacheKey::PlatformLocalId(_) => unreachable!(),
            })
            .is_some());
        let artifact = engine
            .get(key.clone(), ThumbnailSource::Path(path))
            .await
            .unwrap();
        viewed.push((key, artifact));
    }

    assert_eq!(viewed[0].0, viewed[2].0);
    assert_eq!(viewed[0].1.bytes, viewed[2].1.bytes);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

    let cached: Vec<_> = fs::read_dir(cache_root.path().join("content"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(cached.len(), 2);
    assert!(cached.contains(&engine.disk_path(&viewed[0].0)));
}
