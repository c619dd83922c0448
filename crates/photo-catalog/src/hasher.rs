//! Content hashing.
//!
//! Every photo is identified by the MD5 digest of its bytes. MD5 is plenty for
//! content addressing (deduplicating identical files); it is not used for any
//! integrity guarantee against a deliberate attacker.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shard::ShardIndex;

const DIGEST_HEX_LEN: usize = 32;
const READ_CHUNK: usize = 64 * 1024;

/// Lowercase hex MD5 digest of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a digest, accepting exactly 32 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let well_formed = value.len() == DIGEST_HEX_LEN
            && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidHash(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shard this hash routes to under the current format version.
    pub fn shard(&self) -> ShardIndex {
        ShardIndex::route(self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash(format!("{:x}", md5::compute(bytes)))
}

/// Hash a file's contents using streaming I/O, 64KB at a time.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(READ_CHUNK, file);
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }

    Ok(ContentHash(format!("{:x}", context.compute())))
}
