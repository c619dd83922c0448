//! Thumbnail derivation under the fixed PTM-256 policy
//!
//! The short edge is scaled to 256 px and the long edge clamped to 512 px,
//! cropping whatever overflows. Horizontal crops are centered; vertical crops
//! sit higher than center so faces near the top of portraits survive. Output
//! is baseline JPEG, stepped down in quality until it fits the byte cap.
//!
//! Every device must derive byte-identical thumbnails from the same source so
//! a content-addressed cache entry means the same thing everywhere. Nothing in
//! here may depend on time, randomness, or thread scheduling.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Derivation constants. Changing any of them changes the bytes of every
/// thumbnail, so caches built with different policies must not be shared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailPolicy {
    pub short_edge: u32,
    pub long_edge_max: u32,
    pub max_encoded_bytes: usize,
    /// JPEG quality, 1-100.
    pub initial_quality: u8,
    pub quality_step: u8,
    pub floor_quality: u8,
    /// Fraction of the vertical overflow the crop moves up from center.
    pub portrait_upward_bias: f64,
}

impl Default for ThumbnailPolicy {
    fn default() -> Self {
        Self {
            short_edge: 256,
            long_edge_max: 512,
            max_encoded_bytes: 50_000,
            initial_quality: 85,
            quality_step: 5,
            floor_quality: 70,
            portrait_upward_bias: 0.4,
        }
    }
}

/// Source rectangle to keep and the size it is resampled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub out_width: u32,
    pub out_height: u32,
}

pub fn plan_crop(width: u32, height: u32, policy: &ThumbnailPolicy) -> CropPlan {
    let short = width.min(height).max(1);
    let long = width.max(height).max(1);
    let scale = policy.short_edge as f64 / short as f64;

    let scaled_long = (long as f64 * scale).round() as u32;
    let out_long = scaled_long.clamp(policy.short_edge, policy.long_edge_max);
    let crop_long = ((out_long as f64 / scale).round() as u32).clamp(1, long);
    let overflow = long - crop_long;

    if width >= height {
        CropPlan {
            x: overflow / 2,
            y: 0,
            width: crop_long,
            height: short,
            out_width: out_long,
            out_height: policy.short_edge,
        }
    } else {
        let centered = overflow as f64 / 2.0;
        let biased = (centered - policy.portrait_upward_bias * overflow as f64).max(0.0);
        CropPlan {
            x: 0,
            y: (biased.round() as u32).min(overflow),
            width: short,
            height: crop_long,
            out_width: policy.short_edge,
            out_height: out_long,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThumbnailWarning {
    /// Still over the byte cap at floor quality; the thumbnail is usable.
    SizeLimitExceeded { encoded_bytes: usize, max_bytes: usize },
}

/// Encoded thumbnail as produced by a generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedThumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub warning: Option<ThumbnailWarning>,
}

/// Turns source image bytes into an encoded thumbnail.
///
/// Runs on the blocking pool; implementations must be deterministic.
pub trait ThumbnailGenerator: Send + Sync + 'static {
    fn generate(&self, source: &[u8]) -> Result<GeneratedThumbnail>;

    /// Short edge every generated thumbnail targets.
    fn target_short_edge(&self) -> u32;
}

/// The standard generator.
#[derive(Debug, Clone, Default)]
pub struct PolicyGenerator {
    policy: ThumbnailPolicy,
}

impl PolicyGenerator {
    pub fn new(policy: ThumbnailPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ThumbnailPolicy {
        &self.policy
    }
}

impl ThumbnailGenerator for PolicyGenerator {
    fn generate(&self, source: &[u8]) -> Result<GeneratedThumbnail> {
        generate_thumbnail(source, &self.policy)
    }

    fn target_short_edge(&self) -> u32 {
        self.policy.short_edge
    }
}

pub fn generate_thumbnail(source: &[u8], policy: &ThumbnailPolicy) -> Result<GeneratedThumbnail> {
    let img = image::load_from_memory(source).map_err(|e| Error::InvalidSource(e.to_string()))?;
    let rgb = derive_pixels(&img, policy);
    encode_within_budget(&rgb, policy)
}

/// Crop and resample to the policy's output size.
pub fn derive_pixels(img: &DynamicImage, policy: &ThumbnailPolicy) -> RgbImage {
    let (width, height) = img.dimensions();
    let plan = plan_crop(width, height, policy);
    img.crop_imm(plan.x, plan.y, plan.width, plan.height)
        .resize_exact(plan.out_width, plan.out_height, FilterType::Lanczos3)
        .to_rgb8()
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(rgb)
        .map_err(|e| Error::io("failed to encode JPEG", std::io::Error::other(e)))?;
    Ok(buffer)
}

/// Encode at decreasing quality until the result fits the byte cap. At the
/// floor the oversize result is kept and flagged.
pub fn encode_within_budget(
    rgb: &RgbImage,
    policy: &ThumbnailPolicy,
) -> Result<GeneratedThumbnail> {
    let floor = policy.floor_quality.min(policy.initial_quality);
    let step = policy.quality_step.max(1);
    let mut quality = policy.initial_quality;

    loop {
        let bytes = encode_jpeg(rgb, quality)?;
        let fits = bytes.len() <= policy.max_encoded_bytes;
        if fits || quality <= floor {
            let warning = (!fits).then(|| {
                warn!(
                    "Thumbnail is {} bytes at floor quality {} (cap {})",
                    bytes.len(),
                    quality,
                    policy.max_encoded_bytes
                );
                ThumbnailWarning::SizeLimitExceeded {
                    encoded_bytes: bytes.len(),
                    max_bytes: policy.max_encoded_bytes,
                }
            });
            return Ok(GeneratedThumbnail {
                width: rgb.width(),
                height: rgb.height(),
                bytes,
                quality,
                warning,
            });
        }
        quality = quality.saturating_sub(step).max(floor);
    }
}
