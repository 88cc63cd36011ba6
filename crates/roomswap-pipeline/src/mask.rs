//! Selection masks: rasterize an object outline (or its box) into a
//! single-channel raster sized to a specific image.
//!
//! `255` marks the region of interest, `0` the background. A mask is
//! only ever applied to an image of exactly its own size; see
//! [`Mask::ensure_matches`].

use image::GrayImage;
use imageproc::distance_transform::Norm;
use tiny_skia::{FillRule, Path, PathBuilder, Rect, Transform};

use crate::types::{BoundingBox, DetectedObject, Dimensions, PipelineError, PixelRect, Polygon};

/// Raster value of a selected pixel.
pub const SELECTED: u8 = 255;

/// Raster value of a background pixel.
pub const BACKGROUND: u8 = 0;

/// Binary selection raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask(GrayImage);

impl Mask {
    /// All-background mask.
    #[must_use]
    pub fn new(dimensions: Dimensions) -> Self {
        Self(GrayImage::new(dimensions.width, dimensions.height))
    }

    /// Wrap an existing raster. Any non-zero value counts as selected.
    #[must_use]
    pub fn from_image(mut image: GrayImage) -> Self {
        for p in image.pixels_mut() {
            if p.0[0] != BACKGROUND {
                p.0[0] = SELECTED;
            }
        }
        Self(image)
    }

    /// Mask matching the object's outline, or its box when it has none.
    #[must_use]
    pub fn for_object(object: &DetectedObject, dimensions: Dimensions) -> Self {
        object.polygon.as_ref().map_or_else(
            || rasterize_box(&object.bounding_box, dimensions),
            |polygon| rasterize_polygon(polygon, dimensions),
        )
    }

    /// Size of the mask.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.0)
    }

    /// Whether the pixel at `(x, y)` is selected. Out-of-range
    /// coordinates are background.
    #[must_use]
    pub fn is_selected(&self, x: u32, y: u32) -> bool {
        x < self.0.width() && y < self.0.height() && self.0.get_pixel(x, y).0[0] != BACKGROUND
    }

    /// Number of selected pixels.
    #[must_use]
    pub fn selected_count(&self) -> u64 {
        self.0.pixels().filter(|p| p.0[0] != BACKGROUND).count() as u64
    }

    /// Returns `true` if no pixel is selected.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.pixels().all(|p| p.0[0] == BACKGROUND)
    }

    /// Tightest pixel rectangle containing every selected pixel.
    #[must_use]
    pub fn bounds(&self) -> Option<PixelRect> {
        let mut extent: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in self.0.enumerate_pixels() {
            if p.0[0] == BACKGROUND {
                continue;
            }
            extent = Some(match extent {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        extent.map(|(x0, y0, x1, y1)| PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0 + 1,
            height: y1 - y0 + 1,
        })
    }

    /// Check that this mask can be applied to an image of `image` size.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MaskDimensionMismatch`] if the sizes
    /// differ. Masks are never resized implicitly; rebuild them from
    /// rescaled coordinates instead.
    pub fn ensure_matches(&self, image: Dimensions) -> Result<(), PipelineError> {
        let mask = self.dimensions();
        if mask == image {
            Ok(())
        } else {
            Err(PipelineError::MaskDimensionMismatch { mask, image })
        }
    }

    /// Grow the selection by `radius` pixels (chessboard distance).
    #[must_use]
    pub fn dilate(&self, radius: u8) -> Self {
        if radius == 0 {
            return self.clone();
        }
        Self(imageproc::morphology::dilate(&self.0, Norm::LInf, radius))
    }

    /// Borrow the underlying raster.
    #[must_use]
    pub const fn as_image(&self) -> &GrayImage {
        &self.0
    }

    /// Consume the mask and return the underlying raster.
    #[must_use]
    pub fn into_image(self) -> GrayImage {
        self.0
    }
}

/// Fill a polygon into a mask of the given size.
///
/// The fill is aliased and uses the even-odd rule, so self-intersecting
/// outlines leave their doubly-covered regions unselected. A pixel is
/// selected when its centre falls inside the outline, up to the
/// rasterizer's sub-pixel precision. Vertices outside the image are
/// fine; the fill is clipped. Polygons with fewer than three vertices
/// select nothing.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn rasterize_polygon(polygon: &Polygon, dimensions: Dimensions) -> Mask {
    if !polygon.is_fillable() {
        return Mask::new(dimensions);
    }
    let points = polygon.points();
    let mut pb = PathBuilder::new();
    if let Some(first) = points.first() {
        pb.move_to(first.x as f32, first.y as f32);
        for p in &points[1..] {
            pb.line_to(p.x as f32, p.y as f32);
        }
        pb.close();
    }
    fill(pb.finish(), dimensions)
}

/// Fill an axis-aligned box into a mask of the given size.
///
/// Every pixel the box touches is selected; the box is clamped to the
/// image first. A box entirely outside the image selects nothing.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rasterize_box(bounding_box: &BoundingBox, dimensions: Dimensions) -> Mask {
    // Snapping to whole pixels first makes "touched" exact.
    let path = bounding_box
        .clamp_to(dimensions)
        .and_then(|r| Rect::from_xywh(r.x as f32, r.y as f32, r.width as f32, r.height as f32))
        .map(PathBuilder::from_rect);
    fill(path, dimensions)
}

fn fill(path: Option<Path>, dimensions: Dimensions) -> Mask {
    let Some(path) = path else {
        return Mask::new(dimensions);
    };
    // `None` for a zero-sized image.
    let Some(mut raster) = tiny_skia::Mask::new(dimensions.width, dimensions.height) else {
        return Mask::new(dimensions);
    };
    raster.fill_path(&path, FillRule::EvenOdd, false, Transform::identity());
    GrayImage::from_raw(dimensions.width, dimensions.height, raster.data().to_vec())
        .map_or_else(|| Mask::new(dimensions), Mask::from_image)
}
