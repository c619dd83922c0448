//! Photo metadata rows.
//!
//! Row layout (version 1), one record per line:
//!
//! ```text
//! contentHash,filename,sizeBytes,capturedAt,modifiedAt,pixelWidth,pixelHeight
//! ```
//!
//! Timestamps are Unix seconds (UTC). Optional fields are left empty. The
//! filename is percent-encoded so it can never contain a comma or newline.
//! Fields are never reordered within a format version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::ContentHash;

const FIELD_COUNT: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub content_hash: ContentHash,
    pub filename: String,
    pub size_bytes: u64,
    pub captured_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub pixel_width: Option<u32>,
    pub pixel_height: Option<u32>,
}

impl PhotoRecord {
    pub fn new(content_hash: ContentHash, filename: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            content_hash,
            filename: filename.into(),
            size_bytes,
            captured_at: None,
            modified_at: None,
            pixel_width: None,
            pixel_height: None,
        }
    }

    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.content_hash,
            urlencoding::encode(&self.filename),
            self.size_bytes,
            opt_to_field(self.captured_at.map(|t| t.timestamp())),
            opt_to_field(self.modified_at.map(|t| t.timestamp())),
            opt_to_field(self.pixel_width),
            opt_to_field(self.pixel_height),
        )
    }

    pub fn from_row(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim_end_matches('\r').split(',').collect();
        if fields.len() != FIELD_COUNT {
            return Err(Error::InvalidRecord(format!(
                "expected {} fields, found {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let content_hash = ContentHash::parse(fields[0])?;
        let filename = urlencoding::decode(fields[1])
            .map_err(|e| Error::InvalidRecord(format!("filename: {}", e)))?
            .into_owned();
        let size_bytes = fields[2]
            .parse::<u64>()
            .map_err(|e| Error::InvalidRecord(format!("size: {}", e)))?;

        Ok(Self {
            content_hash,
            filename,
            size_bytes,
            captured_at: parse_timestamp(fields[3], "capturedAt")?,
            modified_at: parse_timestamp(fields[4], "modifiedAt")?,
            pixel_width: parse_opt(fields[5], "pixelWidth")?,
            pixel_height: parse_opt(fields[6], "pixelHeight")?,
        })
    }
}

fn opt_to_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_opt<T: std::str::FromStr>(field: &str, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    if field.is_empty() {
        return Ok(None);
    }
    field
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::InvalidRecord(format!("{}: {}", name, e)))
}

fn parse_timestamp(field: &str, name: &str) -> Result<Option<DateTime<Utc>>> {
    match parse_opt::<i64>(field, name)? {
        None => Ok(None),
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| Error::InvalidRecord(format!("{}: out of range", name))),
    }
}
