//! Shard routing and the shard file codec.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::{self, ContentHash};
use crate::record::PhotoRecord;

/// Number of shards under the version-1 routing scheme.
pub const SHARD_COUNT: usize = 16;

/// How records are assigned to shard files.
///
/// Fixed for a format version: readers and writers must agree on where every
/// record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingScheme {
    /// First hex nibble of the content hash selects one of 16 shards.
    #[serde(rename = "hex-nibble-16")]
    HexNibble16,
}

impl ShardingScheme {
    pub fn shard_count(&self) -> usize {
        match self {
            ShardingScheme::HexNibble16 => SHARD_COUNT,
        }
    }
}

/// Position of a shard, `0..SHARD_COUNT`. Its file name is the single hex digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardIndex(u8);

impl ShardIndex {
    pub fn new(index: u8) -> Option<Self> {
        (usize::from(index) < SHARD_COUNT).then_some(Self(index))
    }

    /// Route a content hash to its shard: the value of its first hex digit.
    pub fn route(hash: &ContentHash) -> Self {
        let nibble = hash
            .as_str()
            .as_bytes()
            .first()
            .and_then(|b| (*b as char).to_digit(16))
            .unwrap_or(0);
        Self(nibble as u8)
    }

    pub fn all() -> impl Iterator<Item = ShardIndex> {
        (0..SHARD_COUNT as u8).map(ShardIndex)
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => c.to_digit(16).and_then(|d| Self::new(d as u8)),
            _ => None,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{:x}", self.0)
    }

    pub fn as_usize(&self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Checksum recorded in the manifest for a shard file's exact bytes.
pub fn shard_checksum(bytes: &[u8]) -> String {
    hasher::hash_bytes(bytes).to_string()
}

/// One persisted partition of a catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogShard {
    pub index: ShardIndex,
    pub records: Vec<PhotoRecord>,
}

impl CatalogShard {
    pub fn new(index: ShardIndex) -> Self {
        Self {
            index,
            records: Vec::new(),
        }
    }

    /// One row per record, newline terminated.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_row());
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse shard bytes. Any bad row, or a row that does not route to this
    /// shard, condemns the whole shard and nothing else.
    pub fn decode(index: ShardIndex, bytes: &[u8]) -> Result<Self> {
        let corrupted = |reason: String| Error::Corrupted {
            shard: index.file_name(),
            reason,
        };

        let text = std::str::from_utf8(bytes).map_err(|e| corrupted(e.to_string()))?;
        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = PhotoRecord::from_row(line)
                .map_err(|e| corrupted(format!("line {}: {}", line_no + 1, e)))?;
            if record.content_hash.shard() != index {
                return Err(corrupted(format!(
                    "line {}: record {} belongs to shard {}",
                    line_no + 1,
                    record.content_hash,
                    record.content_hash.shard()
                )));
            }
            records.push(record);
        }
        Ok(Self { index, records })
    }
}
