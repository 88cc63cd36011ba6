//! Geometry utilities: box overlap, point-in-polygon, path bounds and
//! coordinate rescaling.
//!
//! All functions are pure. Coordinates crossing an image-resolution
//! boundary must go through [`Scale`]; nothing here assumes two images
//! share an aspect ratio.

use geo::{Centroid, MultiPoint};
use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, Dimensions, PipelineError, Point, Polygon};

/// Denominator used by [`overlap_ratio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapKind {
    /// Intersection over union (IoU). Symmetric; used for deduplication.
    Union,
    /// Intersection over the smaller box's area. Used for containment
    /// checks: `1.0` means the smaller box lies entirely inside the
    /// larger.
    Smaller,
}

/// Overlap of two boxes as a ratio in `[0, 1]`.
///
/// Returns `0.0` when the boxes do not intersect or the denominator is
/// zero.
#[must_use]
pub fn overlap_ratio(a: &BoundingBox, b: &BoundingBox, kind: OverlapKind) -> f64 {
    let Some(inter) = a.intersection(b) else {
        return 0.0;
    };
    let inter_area = inter.area();
    let denominator = match kind {
        OverlapKind::Union => a.area() + b.area() - inter_area,
        OverlapKind::Smaller => a.area().min(b.area()),
    };
    if denominator <= 0.0 {
        0.0
    } else {
        (inter_area / denominator).clamp(0.0, 1.0)
    }
}

/// Intersection over union; shorthand for
/// `overlap_ratio(a, b, OverlapKind::Union)`.
#[must_use]
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    overlap_ratio(a, b, OverlapKind::Union)
}

/// Even-odd ray-casting containment test.
///
/// A horizontal ray is cast towards `+x`; the point is inside when it
/// crosses the outline an odd number of times. Polygons with fewer than
/// three vertices contain no points.
#[must_use]
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        if let Some(x_cross) = edge_crossing(polygon[i], polygon[j], point.y) {
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// X coordinate where the edge `a`–`b` crosses the horizontal line at
/// `y`, half-open in `y` so shared vertices are counted once.
#[allow(clippy::suboptimal_flops)]
fn edge_crossing(a: Point, b: Point, y: f64) -> Option<f64> {
    if (a.y > y) == (b.y > y) {
        return None;
    }
    Some((b.x - a.x) * (y - a.y) / (b.y - a.y) + a.x)
}

/// Axis-aligned bounds of a point sequence.
///
/// Returns a zero box at the origin for an empty sequence; callers must
/// guard that case themselves.
#[must_use]
pub fn path_bounds(points: &[Point]) -> BoundingBox {
    let Some(first) = points.first() else {
        return BoundingBox::new(0.0, 0.0, 0.0, 0.0);
    };
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &points[1..] {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    BoundingBox::new(min_x, min_y, max_x - min_x, max_y - min_y)
}

/// Mean position of a point sequence, or `None` if it is empty.
#[must_use]
pub fn centroid(points: &[Point]) -> Option<Point> {
    let multi: MultiPoint<f64> = points.iter().map(|p| (p.x, p.y)).collect::<Vec<_>>().into();
    multi.centroid().map(|c| Point::new(c.x(), c.y()))
}

/// Independent X/Y scale factors between two image resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Horizontal factor (`to.width / from.width`).
    pub x: f64,
    /// Vertical factor (`to.height / from.height`).
    pub y: f64,
}

impl Scale {
    /// Scale mapping coordinates measured against `from` onto `to`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ZeroArea`] if either size has a zero
    /// side.
    pub fn between(from: Dimensions, to: Dimensions) -> Result<Self, PipelineError> {
        if from.is_empty() || to.is_empty() {
            return Err(PipelineError::ZeroArea {
                operation: "coordinate rescale",
            });
        }
        Ok(Self {
            x: f64::from(to.width) / f64::from(from.width),
            y: f64::from(to.height) / f64::from(from.height),
        })
    }

    /// Whether this scale leaves coordinates unchanged.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        (self.x - 1.0).abs() < f64::EPSILON && (self.y - 1.0).abs() < f64::EPSILON
    }

    /// Rescale one point.
    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        Point::new(p.x * self.x, p.y * self.y)
    }

    /// Rescale a box.
    #[must_use]
    pub fn apply_box(&self, b: &BoundingBox) -> BoundingBox {
        BoundingBox::new(b.x * self.x, b.y * self.y, b.width * self.x, b.height * self.y)
    }
}

/// Rescale a point sequence from one resolution to another.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if either size has a zero side.
pub fn rescale_points(
    points: &[Point],
    from: Dimensions,
    to: Dimensions,
) -> Result<Vec<Point>, PipelineError> {
    let scale = Scale::between(from, to)?;
    Ok(points.iter().map(|&p| scale.apply(p)).collect())
}

/// Rescale a polygon from one resolution to another.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if either size has a zero side.
pub fn rescale_polygon(
    polygon: &Polygon,
    from: Dimensions,
    to: Dimensions,
) -> Result<Polygon, PipelineError> {
    rescale_points(polygon.points(), from, to).map(Polygon::new)
}

/// Rescale a box from one resolution to another.
///
/// # Errors
///
/// Returns [`PipelineError::ZeroArea`] if either size has a zero side.
pub fn rescale_box(
    b: &BoundingBox,
    from: Dimensions,
    to: Dimensions,
) -> Result<BoundingBox, PipelineError> {
    Ok(Scale::between(from, to)?.apply_box(b))
}
