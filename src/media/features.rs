//! Fixed image -> feature vector transform shared by training and evaluation.

use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

use crate::error::Result;

/// Side length images are resized to before flattening.
pub const FEATURE_SIDE: u32 = 64;
pub const FEATURE_CHANNELS: usize = 3;
/// Length of every feature vector.
pub const FEATURE_LEN: usize = (FEATURE_SIDE * FEATURE_SIDE) as usize * FEATURE_CHANNELS;

/// Resize to 64x64 RGB and flatten row-major, channels interleaved, scaled to [0, 1].
pub fn extract_features(image: &DynamicImage) -> Vec<f32> {
    let resized = image
        .resize_exact(FEATURE_SIDE, FEATURE_SIDE, FilterType::Triangle)
        .to_rgb8();
    resized
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect()
}

/// Decode the image at `path` and extract its features.
pub fn load_features(path: &Path) -> Result<Vec<f32>> {
    let image = image::open(path)?;
    Ok(extract_features(&image))
}
