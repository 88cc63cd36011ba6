//! Mask-driven pixel operations: extract, remove, insert and crop.
//!
//! Every function is a pure transform of its inputs and returns a new
//! image. Masks must match their image exactly; rectangles are clamped to
//! the image and an empty result after clamping is an error rather than a
//! silent no-op.

use image::imageops;

use crate::blur::background_fill;
use crate::config::{RemovalConfig, ResampleFilter};
use crate::mask::Mask;
use crate::types::{BoundingBox, Dimensions, PipelineError, PixelRect, Point, RgbaImage};

/// Keep `image` pixels where `mask` is selected; everything else becomes
/// fully transparent.
///
/// # Errors
///
/// Returns [`PipelineError::MaskDimensionMismatch`] if the sizes differ.
pub fn extract_masked(image: &RgbaImage, mask: &Mask) -> Result<RgbaImage, PipelineError> {
    mask.ensure_matches(Dimensions::of(image))?;
    Ok(RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.is_selected(x, y) {
            *image.get_pixel(x, y)
        } else {
            image::Rgba([0, 0, 0, 0])
        }
    }))
}

/// Replace the masked region with plausible background.
///
/// The mask is first grown by `config.dilation` pixels so the object's
/// soft edges go too. Selected pixels are then replaced by
/// [`background_fill`]; unselected pixels are copied unchanged. This is
/// a blur-based approximation, not inpainting.
///
/// # Errors
///
/// Returns [`PipelineError::MaskDimensionMismatch`] if the sizes differ,
/// or [`PipelineError::ZeroArea`] if the mask selects nothing.
pub fn remove_masked(
    image: &RgbaImage,
    mask: &Mask,
    config: &RemovalConfig,
) -> Result<RgbaImage, PipelineError> {
    mask.ensure_matches(Dimensions::of(image))?;
    if mask.is_blank() {
        return Err(PipelineError::ZeroArea {
            operation: "removal mask",
        });
    }
    let grown = mask.dilate(config.dilation);
    let fill = background_fill(image, &grown, config.blur_sigma)?;

    let mut cleaned = image.clone();
    for (x, y, pixel) in cleaned.enumerate_pixels_mut() {
        if grown.is_selected(x, y) {
            *pixel = *fill.get_pixel(x, y);
        }
    }
    Ok(cleaned)
}

/// Scale `content` to fit inside `target` preserving its aspect ratio,
/// centred on a transparent canvas of exactly `target` size.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if `content` or `target` is
/// empty.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn letterbox(
    content: &RgbaImage,
    target: Dimensions,
    filter: ResampleFilter,
) -> Result<RgbaImage, PipelineError> {
    let source = Dimensions::of(content);
    if source.is_empty() || target.is_empty() {
        return Err(PipelineError::ZeroArea {
            operation: "letterbox",
        });
    }
    let scale = (f64::from(target.width) / f64::from(source.width))
        .min(f64::from(target.height) / f64::from(source.height));
    let fit = |side: u32, limit: u32| ((f64::from(side) * scale).round() as u32).clamp(1, limit);
    let width = fit(source.width, target.width);
    let height = fit(source.height, target.height);

    let resized = if (width, height) == (source.width, source.height) {
        content.clone()
    } else {
        imageops::resize(content, width, height, filter.to_image_filter())
    };
    let mut canvas = RgbaImage::new(target.width, target.height);
    imageops::replace(
        &mut canvas,
        &resized,
        i64::from((target.width - width) / 2),
        i64::from((target.height - height) / 2),
    );
    Ok(canvas)
}

/// Pixel rectangle of `base` covered by a `target`-sized placement at
/// `position`, after clamping.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if nothing of the placement lies
/// inside `base`.
pub fn placement(
    base: Dimensions,
    position: Point,
    target: Dimensions,
) -> Result<PixelRect, PipelineError> {
    BoundingBox::new(
        position.x.round(),
        position.y.round(),
        f64::from(target.width),
        f64::from(target.height),
    )
    .clamp_to(base)
    .ok_or(PipelineError::ZeroArea {
        operation: "insertion",
    })
}

/// Letterbox `content` into `target` and composite it "over" `base` with
/// its top-left corner at `position`.
///
/// Opaque content pixels replace base pixels, transparent ones leave the
/// base untouched, partial alpha blends. The part of the placement
/// outside `base` is dropped.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if the content or target is
/// empty, or if the placement misses `base` entirely.
#[allow(clippy::cast_possible_truncation)]
pub fn insert_scaled(
    base: &RgbaImage,
    content: &RgbaImage,
    position: Point,
    target: Dimensions,
    filter: ResampleFilter,
) -> Result<RgbaImage, PipelineError> {
    placement(Dimensions::of(base), position, target)?;
    let boxed = letterbox(content, target, filter)?;
    let mut out = base.clone();
    imageops::overlay(
        &mut out,
        &boxed,
        position.x.round() as i64,
        position.y.round() as i64,
    );
    Ok(out)
}

/// Copy the part of `image` inside `region`, clamped to the image.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if nothing of `region` lies
/// inside the image.
pub fn crop(image: &RgbaImage, region: &BoundingBox) -> Result<RgbaImage, PipelineError> {
    let rect = region
        .clamp_to(Dimensions::of(image))
        .ok_or(PipelineError::ZeroArea { operation: "crop" })?;
    Ok(imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image())
}
