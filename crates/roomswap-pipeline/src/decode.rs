//! Image decoding, PNG encoding and working-resolution downsampling.
//!
//! Photos arrive as raw bytes (PNG, JPEG, BMP, WebP) and are decoded to
//! RGBA once. Detectors see a copy downsampled so the longest axis is at
//! most the configured working resolution; everything they report is
//! rescaled back to the original size before masking.

use image::ImageEncoder;

use crate::config::ResampleFilter;
use crate::types::{Dimensions, PipelineError, RgbaImage};

/// Decode raw image bytes to RGBA.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty, or
/// [`PipelineError::ImageDecode`] if the format is unrecognized or the
/// data is corrupt.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba8())
}

/// Encode an RGBA image as PNG bytes.
///
/// # Errors
///
/// Returns [`PipelineError::ImageDecode`] if the encoder rejects the
/// buffer.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    image::codecs::png::PngEncoder::new(&mut buf).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(buf)
}

/// Size an image of `dimensions` takes when its longest axis is limited
/// to `max_dimension`, preserving aspect ratio. Images already small
/// enough keep their size.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn working_dimensions(dimensions: Dimensions, max_dimension: u32) -> Dimensions {
    let long_axis = dimensions.width.max(dimensions.height);
    if long_axis <= max_dimension || long_axis == 0 {
        return dimensions;
    }
    let ratio = f64::from(max_dimension) / f64::from(long_axis);
    let scale = |side: u32| ((f64::from(side) * ratio).round() as u32).max(1);
    Dimensions::new(scale(dimensions.width), scale(dimensions.height))
}

/// Downsample so the longest axis is at most `max_dimension` pixels.
///
/// Returns the (possibly unchanged) image and whether downsampling was
/// actually applied.
#[must_use]
pub fn downsample(
    image: &RgbaImage,
    max_dimension: u32,
    filter: ResampleFilter,
) -> (RgbaImage, bool) {
    let original = Dimensions::of(image);
    let target = working_dimensions(original, max_dimension);
    if target == original {
        return (image.clone(), false);
    }
    let resized = image::imageops::resize(
        image,
        target.width,
        target.height,
        filter.to_image_filter(),
    );
    (resized, true)
}
