use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use photo_catalog::{
    hash_file, DirectoryCatalogIndex, DirectoryIdentityResolver, Freshness, LocalDirectory,
    NetworkCacheConfig, NetworkCatalogCache, PhotoRecord,
};
use thumbnail_cache::{ThumbnailCacheEngine, ThumbnailCacheKey, ThumbnailConfig, ThumbnailSource};
use tracing_subscriber::EnvFilter;

mod scan;

#[derive(Parser)]
#[command(name = "photolala")]
#[command(about = "Catalog photo directories and manage the shared thumbnail cache")]
struct Cli {
    /// Cache directory (defaults to $PHOTOLALA_CACHE_DIR or the platform cache dir)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory and bring its catalog up to date
    Index {
        path: PathBuf,

        /// Include photos in subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// List the records in a directory's catalog
    Ls {
        path: PathBuf,

        /// Read through the network catalog cache (with a local mirror)
        #[arg(long)]
        cached: bool,
    },

    /// Print the cache key a directory resolves to
    Key { path: PathBuf },

    /// Produce the thumbnail for one photo
    Thumb {
        path: PathBuf,

        /// Copy the thumbnail here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Maintain the thumbnail cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every cached thumbnail
    Clear,
    /// Delete the oldest thumbnails until the cache fits
    Trim {
        #[arg(long, default_value = "512")]
        max_mb: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let thumbnail_root = match &cli.cache_dir {
        Some(dir) => dir.join("thumbnails"),
        None => thumbnail_cache::default_cache_root(),
    };

    match cli.command {
        Commands::Index { path, recursive } => index_directory(&path, recursive).await,
        Commands::Ls { path, cached } => {
            if cached {
                let mirror = thumbnail_root
                    .parent()
                    .map(|base| base.join("catalogs"))
                    .unwrap_or_else(|| thumbnail_root.join("catalogs"));
                list_cached(&path, mirror).await
            } else {
                list_catalog(&path).await
            }
        }
        Commands::Key { path } => print_key(&path).await,
        Commands::Thumb { path, out } => {
            let config = ThumbnailConfig::with_cache_root(thumbnail_root);
            let engine = ThumbnailCacheEngine::new(config);
            make_thumbnail(&engine, &path, out.as_deref()).await
        }
        Commands::Cache { action } => {
            let config = ThumbnailConfig::with_cache_root(thumbnail_root);
            let engine = ThumbnailCacheEngine::new(config);
            match action {
                CacheAction::Clear => {
                    engine.clear_all().await?;
                    println!("🧹 Cleared {}", engine.config().cache_root.display());
                    Ok(())
                }
                CacheAction::Trim { max_mb } => {
                    let summary = engine.trim_disk(max_mb * 1024 * 1024).await?;
                    println!(
                        "🧹 Removed {} files ({} bytes), {} bytes remain",
                        summary.files_removed, summary.bytes_removed, summary.bytes_remaining
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn index_directory(path: &Path, recursive: bool) -> Result<()> {
    println!("🔍 Indexing photos in: {}", path.display());

    let entries = scan::list_photos(path, recursive)?;
    let mut index = DirectoryCatalogIndex::open_or_create(path)
        .await
        .with_context(|| format!("Failed to open catalog for {}", path.display()))?;

    // Hashing fans out over rayon; keep it off the async workers.
    let summary = tokio::task::block_in_place(|| index.reconcile(&entries, scan::inspect));
    let flushed = index
        .flush()
        .await
        .with_context(|| format!("Failed to write catalog for {}", path.display()))?;

    println!("📸 Found {} photos", summary.scanned);
    println!(
        "   {} added, {} updated, {} removed, {} unchanged",
        summary.added, summary.updated, summary.removed, summary.unchanged
    );
    if summary.duplicates > 0 {
        println!("   {} duplicates share content with another file", summary.duplicates);
    }
    if summary.failed > 0 {
        println!("⚠️  Failed to read {} files", summary.failed);
    }
    println!(
        "💾 Wrote {} shards{}",
        flushed.shards_written,
        if flushed.manifest_written { " and the manifest" } else { "" }
    );
    Ok(())
}

async fn list_catalog(path: &Path) -> Result<()> {
    let index = DirectoryCatalogIndex::open(path)
        .await
        .with_context(|| format!("Failed to open catalog for {}", path.display()))?;

    for (shard, error) in index.corrupted_shards() {
        println!("⚠️  Shard {} unreadable: {}", shard, error);
    }
    let mut records: Vec<&PhotoRecord> = index.all_records().collect();
    records.sort_by(|a, b| a.filename.cmp(&b.filename));
    print_records(&records);
    Ok(())
}

async fn list_cached(path: &Path, mirror: PathBuf) -> Result<()> {
    let cache = NetworkCatalogCache::new(NetworkCacheConfig::default().with_mirror(mirror));
    let cached = cache
        .get(&LocalDirectory::new(path))
        .await
        .with_context(|| format!("Failed to load catalog for {}", path.display()))?;

    match &cached.freshness {
        Freshness::Stale { reason } => println!("⚠️  Showing a mirrored copy: {}", reason),
        other => tracing::debug!("Catalog {} is {:?}", cached.key, other),
    }
    let mut records: Vec<&PhotoRecord> = cached.snapshot.records().iter().collect();
    records.sort_by(|a, b| a.filename.cmp(&b.filename));
    print_records(&records);
    Ok(())
}

fn print_records(records: &[&PhotoRecord]) {
    for record in records {
        let dimensions = match (record.pixel_width, record.pixel_height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "-".to_string(),
        };
        let captured = record
            .captured_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:>10}  {:>11}  {}  {}",
            record.content_hash, record.size_bytes, dimensions, captured, record.filename
        );
    }
    println!("{} records", records.len());
}

async fn print_key(path: &Path) -> Result<()> {
    let resolution = DirectoryIdentityResolver::new().resolve_path(path).await;
    println!("{}  ({:?})", resolution.key, resolution.origin);
    Ok(())
}

async fn make_thumbnail(
    engine: &ThumbnailCacheEngine,
    path: &Path,
    out: Option<&Path>,
) -> Result<()> {
    let source = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || hash_file(&source))
        .await?
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let key = ThumbnailCacheKey::ContentHash(hash);
    let artifact = engine
        .get(key.clone(), ThumbnailSource::Path(path.to_path_buf()))
        .await
        .with_context(|| format!("Failed to produce thumbnail for {}", path.display()))?;

    println!(
        "🖼️  {} {}x{} ({} bytes)",
        key,
        artifact.width,
        artifact.height,
        artifact.byte_size()
    );
    if let Some(warning) = &artifact.warning {
        println!("⚠️  {:?}", warning);
    }

    match out {
        Some(out) => {
            tokio::fs::write(out, &artifact.bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("💾 Saved to: {}", out.display());
        }
        None => println!("💾 Cached at: {}", engine.disk_path(&key).display()),
    }
    Ok(())
}
