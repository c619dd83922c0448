//! The catalog manifest: version, directory identity, shard checksums.
//!
//! Stored as JSON at `<directory>/.photolala/manifest`. The manifest is the
//! commit point of every catalog write: it only ever names shard files whose
//! bytes were fully written before it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::shard::{ShardIndex, ShardingScheme};

/// Catalog format this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

/// Subdirectory holding a directory's catalog.
pub const CATALOG_DIR: &str = ".photolala";

/// Manifest file name inside [`CATALOG_DIR`].
pub const MANIFEST_FILE: &str = "manifest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogManifest {
    pub format_version: u32,
    /// Generated once per catalog and never reused; survives moves and
    /// remounts of the directory.
    #[serde(rename = "directoryUUID")]
    pub directory_uuid: Uuid,
    pub sharding_scheme: ShardingScheme,
    /// Shard file name → checksum of that file's bytes.
    pub shard_checksums: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    format_version: u32,
}

#[derive(Deserialize)]
struct IdentityProbe {
    #[serde(rename = "directoryUUID")]
    directory_uuid: Uuid,
}

impl CatalogManifest {
    /// A fresh manifest for a directory that has never had a catalog.
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            directory_uuid: Uuid::new_v4(),
            sharding_scheme: ShardingScheme::HexNibble16,
            shard_checksums: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::CorruptedManifest(e.to_string()))
    }

    /// Parse manifest bytes. The version is checked before anything else so a
    /// newer layout is reported as unsupported rather than as corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe =
            serde_json::from_slice(bytes).map_err(|e| Error::CorruptedManifest(e.to_string()))?;
        if probe.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: probe.format_version,
                supported: FORMAT_VERSION,
            });
        }

        let manifest: CatalogManifest =
            serde_json::from_slice(bytes).map_err(|e| Error::CorruptedManifest(e.to_string()))?;
        for name in manifest.shard_checksums.keys() {
            if ShardIndex::from_file_name(name).is_none() {
                return Err(Error::CorruptedManifest(format!(
                    "unknown shard name {:?}",
                    name
                )));
            }
        }
        Ok(manifest)
    }

    /// Pull only the directory UUID out of manifest bytes, whatever their
    /// version.
    pub fn peek_directory_uuid(bytes: &[u8]) -> Option<Uuid> {
        serde_json::from_slice::<IdentityProbe>(bytes)
            .ok()
            .map(|probe| probe.directory_uuid)
    }

    pub fn checksum(&self, index: ShardIndex) -> Option<&str> {
        self.shard_checksums
            .get(&index.file_name())
            .map(String::as_str)
    }

    pub fn set_checksum(&mut self, index: ShardIndex, checksum: String) {
        self.shard_checksums.insert(index.file_name(), checksum);
    }

    /// Shards the manifest vouches for, in shard order.
    pub fn listed_shards(&self) -> Vec<ShardIndex> {
        self.shard_checksums
            .keys()
            .filter_map(|name| ShardIndex::from_file_name(name))
            .collect()
    }
}

impl Default for CatalogManifest {
    fn default() -> Self {
        Self::new()
    }
}
