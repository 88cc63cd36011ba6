//! Gaussian blur and the blurred-background fill used for object removal.
//!
//! [`gaussian_blur_rgba`] applies the same blur independently to each
//! R/G/B/A channel of a color image.
//!
//! [`background_fill`] estimates what lies behind a masked region by
//! blurring only the unmasked pixels: each colour is weighted by a
//! background indicator, the weights are blurred alongside, and the
//! result is divided back out (normalized convolution). Masked pixels
//! therefore never bleed their own colour into the fill. Where no
//! background is within reach of the kernel, the plain blur of the whole
//! image is used instead.

use image::{GrayImage, Rgba, Rgba32FImage};

use crate::mask::Mask;
use crate::types::{Dimensions, PipelineError, RgbaImage};

/// Blurred background weight below which [`background_fill`] falls back
/// to the plain blur.
pub const MIN_BACKGROUND_WEIGHT: f32 = 1e-3;

/// Apply Gaussian blur to an RGBA image by blurring each channel
/// independently.
///
/// `imageproc::filter::gaussian_blur_f32` only accepts single-channel
/// images, so this splits the RGBA image into four channels, blurs each,
/// and reassembles. Gaussian blur is linear and per-channel, so this is
/// equivalent to blurring in colour space.
///
/// Non-positive sigma values return the image unchanged, since
/// `imageproc` panics on `sigma <= 0.0`.
#[must_use = "returns the blurred RGBA image"]
pub fn gaussian_blur_rgba(image: &RgbaImage, sigma: f32) -> RgbaImage {
    if sigma <= 0.0 {
        return image.clone();
    }

    let (w, h) = (image.width(), image.height());

    let channels: [GrayImage; 4] = std::array::from_fn(|c| {
        GrayImage::from_fn(w, h, |x, y| image::Luma([image.get_pixel(x, y).0[c]]))
    });

    let blurred: [GrayImage; 4] =
        std::array::from_fn(|c| imageproc::filter::gaussian_blur_f32(&channels[c], sigma));

    RgbaImage::from_fn(w, h, |x, y| {
        Rgba([
            blurred[0].get_pixel(x, y).0[0],
            blurred[1].get_pixel(x, y).0[0],
            blurred[2].get_pixel(x, y).0[0],
            blurred[3].get_pixel(x, y).0[0],
        ])
    })
}

/// Estimate the background behind every pixel from unmasked pixels only.
///
/// The returned image has the same size as `image`. Its colour at each
/// pixel is the Gaussian-weighted mean of nearby *unselected* pixels of
/// `image`; alpha is copied from `image`. Callers normally only use the
/// fill where `mask` is selected.
///
/// # Errors
///
/// Returns [`PipelineError::MaskDimensionMismatch`] if `mask` and
/// `image` differ in size, or [`PipelineError::InvalidConfig`] for a
/// non-positive `sigma`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::many_single_char_names)]
pub fn background_fill(
    image: &RgbaImage,
    mask: &Mask,
    sigma: f32,
) -> Result<RgbaImage, PipelineError> {
    mask.ensure_matches(Dimensions::of(image))?;
    if sigma.is_nan() || sigma <= 0.0 {
        return Err(PipelineError::InvalidConfig(format!(
            "background fill sigma must be positive, got {sigma}"
        )));
    }

    // Premultiply colour by the background indicator; alpha carries the
    // indicator itself.
    let weighted = Rgba32FImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        let w = if mask.is_selected(x, y) { 0.0 } else { 1.0 };
        Rgba([
            f32::from(r) / 255.0 * w,
            f32::from(g) / 255.0 * w,
            f32::from(b) / 255.0 * w,
            w,
        ])
    });
    let spread = image::imageops::blur(&weighted, sigma);
    let plain = gaussian_blur_rgba(image, sigma);

    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    Ok(RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, w] = spread.get_pixel(x, y).0;
        let alpha = image.get_pixel(x, y).0[3];
        if w >= MIN_BACKGROUND_WEIGHT {
            Rgba([to_u8(r / w), to_u8(g / w), to_u8(b / w), alpha])
        } else {
            let [pr, pg, pb, _] = plain.get_pixel(x, y).0;
            Rgba([pr, pg, pb, alpha])
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mask::rasterize_box;
    use crate::types::BoundingBox;

    fn channel_close(actual: u8, expected: u8, tolerance: u8) -> bool {
        actual.abs_diff(expected) <= tolerance
    }

    // ─────── gaussian_blur_rgba ──────────────────────────────────

    #[test]
    fn rgba_zero_sigma_returns_identical_image() {
        let img = RgbaImage::from_fn(4, 4, |_, _| Rgba([100, 150, 200, 255]));
        assert_eq!(gaussian_blur_rgba(&img, 0.0), img);
        assert_eq!(gaussian_blur_rgba(&img, -1.0), img);
    }

    #[test]
    fn rgba_output_dimensions_preserved() {
        let img = RgbaImage::new(17, 31);
        let blurred = gaussian_blur_rgba(&img, 1.4);
        assert_eq!(blurred.width(), 17);
        assert_eq!(blurred.height(), 31);
    }

    #[test]
    fn rgba_blur_smooths_sharp_color_edge() {
        // Left half red, right half blue, sharp boundary at x=5.
        let img = RgbaImage::from_fn(10, 10, |x, _y| {
            if x < 5 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let blurred = gaussian_blur_rgba(&img, 2.0);

        let left = blurred.get_pixel(4, 5).0[0];
        let right = blurred.get_pixel(5, 5).0[0];
        assert!(left < 255, "expected red to decrease near boundary, got {left}");
        assert!(right > 0, "expected red to increase near boundary, got {right}");
    }

    #[test]
    fn rgba_uniform_unchanged_by_blur() {
        let img = RgbaImage::from_fn(10, 10, |_, _| Rgba([100, 150, 200, 250]));
        let blurred = gaussian_blur_rgba(&img, 1.4);
        for pixel in blurred.pixels() {
            for (c, &exp) in [100_u8, 150, 200, 250].iter().enumerate() {
                assert!(
                    channel_close(pixel.0[c], exp, 1),
                    "channel {c}: expected ~{exp}, got {}",
                    pixel.0[c],
                );
            }
        }
    }

    // ─────── background_fill ─────────────────────────────────────

    #[test]
    fn fill_ignores_masked_object_colour() {
        // Grey wall with a bright green object in the middle.
        let object = BoundingBox::new(12.0, 12.0, 8.0, 8.0);
        let img = RgbaImage::from_fn(32, 32, |x, y| {
            if (12..20).contains(&x) && (12..20).contains(&y) {
                Rgba([0, 255, 0, 255])
            } else {
                Rgba([120, 120, 120, 255])
            }
        });
        let mask = rasterize_box(&object, Dimensions::new(32, 32));
        let fill = background_fill(&img, &mask, 4.0).unwrap();
        let centre = fill.get_pixel(16, 16).0;
        for c in 0..3 {
            assert!(
                channel_close(centre[c], 120, 2),
                "channel {c}: expected wall grey, got {}",
                centre[c],
            );
        }
        assert_eq!(centre[3], 255);
    }

    #[test]
    fn fully_masked_image_falls_back_to_plain_blur() {
        let img = RgbaImage::from_fn(8, 8, |x, _| Rgba([u8::try_from(x * 30).unwrap(), 0, 0, 255]));
        let mask = rasterize_box(&BoundingBox::new(0.0, 0.0, 8.0, 8.0), Dimensions::new(8, 8));
        let fill = background_fill(&img, &mask, 2.0).unwrap();
        let plain = gaussian_blur_rgba(&img, 2.0);
        for (f, p) in fill.pixels().zip(plain.pixels()) {
            assert_eq!(f.0[..3], p.0[..3]);
            assert_eq!(f.0[3], 255);
        }
    }

    #[test]
    fn fill_rejects_mismatched_mask() {
        let img = RgbaImage::new(8, 8);
        let mask = Mask::new(Dimensions::new(4, 4));
        assert!(matches!(
            background_fill(&img, &mask, 2.0),
            Err(PipelineError::MaskDimensionMismatch { .. })
        ));
    }

    #[test]
    fn fill_rejects_non_positive_sigma() {
        let img = RgbaImage::new(4, 4);
        let mask = Mask::new(Dimensions::new(4, 4));
        assert!(matches!(
            background_fill(&img, &mask, 0.0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
