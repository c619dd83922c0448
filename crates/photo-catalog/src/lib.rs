//! Photo catalogs for Photolala directories
//!
//! Each directory carries a small, versioned, content-addressed index of its
//! photos under `.photolala/`: a JSON manifest plus 16 hash-routed shard files
//! of text rows. This crate reads and writes that format, keeps a mutable
//! in-memory view of it, derives stable cache keys for directories that can be
//! reached by several paths, and caches catalogs of slow network directories.

pub mod config;
pub mod error;
pub mod hasher;
pub mod identity;
pub mod index;
pub mod manifest;
pub mod network;
pub mod record;
pub mod shard;
pub mod store;

pub use config::NetworkCacheConfig;
pub use error::{Error, Result};
pub use hasher::{hash_bytes, hash_file, ContentHash};
pub use identity::{CacheKey, DirectoryIdentityResolver, KeyOrigin, Resolution};
pub use index::{
    DirectoryCatalogIndex, DirectoryEntry, FileDetails, FlushSummary, ReconcileSummary,
};
pub use manifest::{CatalogManifest, CATALOG_DIR, FORMAT_VERSION};
pub use network::{
    CachedCatalog, CatalogSnapshot, Freshness, NetworkCatalogCache, RemoteDirectory,
    SourceFingerprint,
};
pub use record::PhotoRecord;
pub use shard::{CatalogShard, ShardIndex, ShardingScheme};
pub use store::{
    load_catalog, write_atomic, CatalogReader, CatalogShardStore, LoadedCatalog, LocalDirectory,
};
