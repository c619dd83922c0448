//! Directory enumeration and per-file inspection for the CLI

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use photo_catalog::{hash_file, DirectoryEntry, FileDetails, CATALOG_DIR};
use tracing::debug;
use walkdir::WalkDir;

/// Extensions treated as photos.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif", "cr3", "cr2",
    "nef", "arw", "raf", "dng",
];

/// Whether the path has one of the [`IMAGE_EXTENSIONS`].
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// List the photos in `directory`, sorted by path. Hidden entries and the
/// catalog directory itself are skipped.
pub fn list_photos(directory: &Path, recursive: bool) -> Result<Vec<DirectoryEntry>> {
    if !directory.is_dir() {
        anyhow::bail!("Path is not a directory: {}", directory.display());
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(directory)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.') || name == CATALOG_DIR)
                    .unwrap_or(false)
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry
            .with_context(|| format!("Failed to enumerate {}", directory.display()))?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        entries.push(DirectoryEntry {
            path: entry.into_path(),
            size_bytes: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    Ok(entries)
}

/// Hash a file and pull what metadata we can from it. Only the hash is
/// required; missing EXIF or an undecodable header leaves the fields empty.
pub fn inspect(path: &Path) -> std::io::Result<FileDetails> {
    let mut details = FileDetails::new(hash_file(path)?);

    match image::image_dimensions(path) {
        Ok((width, height)) => {
            details.pixel_width = Some(width);
            details.pixel_height = Some(height);
        }
        Err(e) => debug!("No dimensions for {}: {}", path.display(), e),
    }
    details.captured_at = capture_time(path);

    Ok(details)
}

/// `DateTimeOriginal` from the file's EXIF block.
fn capture_time(path: &Path) -> Option<DateTime<Utc>> {
    let exif = match rexif::parse_file(path) {
        Ok(exif) => exif,
        Err(e) => {
            debug!("No EXIF in {}: {}", path.display(), e);
            return None;
        }
    };

    exif.entries
        .iter()
        .find(|entry| entry.tag == rexif::ExifTag::DateTimeOriginal)
        .and_then(|entry| match &entry.value {
            rexif::TagValue::Ascii(text) => parse_exif_datetime(text),
            _ => None,
        })
}

/// EXIF timestamps carry no zone; they are taken as UTC.
pub fn parse_exif_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim_end_matches('\0').trim();
    NaiveDateTime::parse_from_str(text, "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
