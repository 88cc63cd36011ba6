//! Shared types for the roomswap detection-to-replacement pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intent::Resolution;

/// Re-export `GrayImage` so downstream crates can reference mask
/// rasters without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so downstream crates can reference decoded
/// photographs without depending on `image` directly.
pub use image::RgbaImage;

/// A 2D point in image (or canvas) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of an image buffer.
    #[must_use]
    pub fn of<P: image::Pixel>(image: &image::ImageBuffer<P, Vec<P::Subpixel>>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether either side is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The full-image rectangle.
    #[must_use]
    pub fn bounds(self) -> BoundingBox {
        BoundingBox::new(0.0, 0.0, f64::from(self.width), f64::from(self.height))
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned rectangle in a specific image's pixel space.
///
/// `width` and `height` are never negative; the origin may sit outside
/// the image while intermediate math is in flight. Use
/// [`clamp_to`](Self::clamp_to) before touching pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Horizontal extent (>= 0).
    pub width: f64,
    /// Vertical extent (>= 0).
    pub height: f64,
}

impl BoundingBox {
    /// Create a box; negative extents collapse to zero.
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Create a box from two opposite corners in any order.
    #[must_use]
    pub fn from_corners(a: Point, b: Point) -> Self {
        let x0 = a.x.min(b.x);
        let y0 = a.y.min(b.y);
        Self::new(x0, y0, a.x.max(b.x) - x0, a.y.max(b.y) - y0)
    }

    /// Right edge (`x + width`).
    #[must_use]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge (`y + height`).
    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Area in square pixels.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Whether the box has zero area.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            self.width.mul_add(0.5, self.x),
            self.height.mul_add(0.5, self.y),
        )
    }

    /// Length of the diagonal.
    #[must_use]
    pub fn diagonal(&self) -> f64 {
        self.width.hypot(self.height)
    }

    /// The four corners, clockwise from top-left.
    #[must_use]
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.right(), self.y),
            Point::new(self.right(), self.bottom()),
            Point::new(self.x, self.bottom()),
        ]
    }

    /// Overlapping region of two boxes, or `None` if they only touch
    /// or are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 > x0 && y1 > y0 {
            Some(Self::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }

    /// Integer pixel rectangle covering this box, clamped to the image.
    ///
    /// Edges are expanded outward to whole pixels before clamping.
    /// Returns `None` when nothing of the box lies inside the image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_lossless)]
    pub fn clamp_to(&self, dimensions: Dimensions) -> Option<PixelRect> {
        let max_x = f64::from(dimensions.width);
        let max_y = f64::from(dimensions.height);
        let x0 = self.x.floor().clamp(0.0, max_x);
        let y0 = self.y.floor().clamp(0.0, max_y);
        let x1 = self.right().ceil().clamp(0.0, max_x);
        let y1 = self.bottom().ceil().clamp(0.0, max_y);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Integer rectangle that lies entirely inside some image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width in pixels (> 0).
    pub width: u32,
    /// Height in pixels (> 0).
    pub height: u32,
}

impl PixelRect {
    /// Size of the rectangle.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Convert back to floating-point box space.
    #[must_use]
    pub fn to_bounding_box(self) -> BoundingBox {
        BoundingBox::new(
            f64::from(self.x),
            f64::from(self.y),
            f64::from(self.width),
            f64::from(self.height),
        )
    }
}

/// Closed outline of an object; the last vertex connects back to the
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon(Vec<Point>);

impl Polygon {
    /// Create a polygon from its vertices.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Decode a flat `[x0, y0, x1, y1, ...]` coordinate list, the shape
    /// detector services use for segmentation contours. A dangling odd
    /// value is ignored.
    #[must_use]
    pub fn from_flat(coords: &[f64]) -> Self {
        Self(
            coords
                .chunks_exact(2)
                .map(|pair| Point::new(pair[0], pair[1]))
                .collect(),
        )
    }

    /// Number of vertices.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the polygon has no vertices.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the polygon can enclose anything (three or more vertices).
    #[must_use]
    pub const fn is_fillable(&self) -> bool {
        self.0.len() >= 3
    }

    /// Slice of all vertices.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Consume the polygon and return its vertices.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.0
    }

    /// Axis-aligned bounds of the vertices.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        crate::geometry::path_bounds(&self.0)
    }
}

/// Freehand outline drawn by the user, in canvas coordinates.
///
/// An empty path means "analyze the whole image".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawingPath(Vec<Point>);

impl DrawingPath {
    /// Create a path from pointer samples.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Returns `true` if nothing was drawn.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of samples.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Slice of all samples.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }
}

/// Which detector produced a detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorSource {
    /// General-purpose instance segmentation model (furniture, decor).
    InstanceSegmenter,
    /// Specialist model for walls, floors, ceilings, doors and windows.
    ArchitecturalSegmenter,
    /// Label/box classifier without contours.
    ObjectClassifier,
    /// Any other detector, by name.
    Custom(String),
}

impl From<&str> for DetectorSource {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "instance-segmenter" | "yolo" | "base" => Self::InstanceSegmenter,
            "architectural-segmenter" | "walls_floors_specialist" | "walls_floors" => {
                Self::ArchitecturalSegmenter
            }
            "object-classifier" | "classifier" | "vision" => Self::ObjectClassifier,
            _ => Self::Custom(name.to_owned()),
        }
    }
}

impl fmt::Display for DetectorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceSegmenter => f.write_str("instance-segmenter"),
            Self::ArchitecturalSegmenter => f.write_str("architectural-segmenter"),
            Self::ObjectClassifier => f.write_str("object-classifier"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// How precisely a fused detection can be masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// A polygon is available; masks follow the object outline.
    Segmentable,
    /// Only a box is available, but the class exists in the
    /// polygon-capable detector's vocabulary under `segmenter_class`.
    Redetectable {
        /// Class name to ask the segmenter for.
        segmenter_class: String,
    },
    /// Only a box is available; masks are rectangular.
    BoundingBoxOnly,
}

/// One object reported by one detector.
///
/// Detections are never mutated once built: fusion hands out tagged
/// copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Class label in the reporting detector's vocabulary.
    pub name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Box in the coordinate space of the analyzed image.
    pub bounding_box: BoundingBox,
    /// Authoritative outline when the detector produced one.
    pub polygon: Option<Polygon>,
    /// Reporting detector.
    pub source: DetectorSource,
    /// Whether `polygon` is usable for masking.
    pub can_segment: bool,
    /// Fusion tag.
    pub capability: Capability,
}

impl DetectedObject {
    /// Box-only detection. Confidence is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        confidence: f64,
        bounding_box: BoundingBox,
        source: DetectorSource,
    ) -> Self {
        Self {
            name: name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
            polygon: None,
            source,
            can_segment: false,
            capability: Capability::BoundingBoxOnly,
        }
    }

    /// Attach an outline. Polygons with fewer than three vertices are
    /// dropped since they cannot be filled.
    #[must_use]
    pub fn with_polygon(mut self, polygon: Polygon) -> Self {
        if polygon.is_fillable() {
            self.polygon = Some(polygon);
            self.can_segment = true;
            self.capability = Capability::Segmentable;
        }
        self
    }

    /// Copy of this detection with a different capability tag.
    #[must_use]
    pub fn tagged(&self, capability: Capability) -> Self {
        Self {
            capability,
            ..self.clone()
        }
    }
}

/// Per-factor breakdown of an intention score, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    /// Fraction of box grid samples inside the drawn path.
    pub enclosure: f64,
    /// Closeness of the path centroid to the box centre.
    pub distance: f64,
    /// Smaller-over-larger area ratio of path bounds and box.
    pub size: f64,
    /// Detector confidence.
    pub confidence: f64,
    /// Fraction of box corners inside the drawn path.
    pub containment: f64,
}

/// A detection scored against a drawn path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// The scored detection.
    pub object: DetectedObject,
    /// Weighted combination of `factors`.
    pub score: f64,
    /// Individual factors.
    pub factors: ScoreFactors,
}

/// Failure reported by an external collaborator (detector, generator,
/// result sink).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The call completed with an error.
    #[error("{0}")]
    Failed(String),

    /// The call did not complete in time.
    #[error("timed out")]
    Timeout,
}

/// Errors that can occur during pipeline processing.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// A detector failed or timed out.
    #[error("detector {detector} unavailable: {error}")]
    DetectionUnavailable {
        /// The detector that failed.
        detector: DetectorSource,
        /// Upstream error.
        #[source]
        error: CollaboratorError,
    },

    /// Every detector failed, or none reported anything usable.
    #[error("no detections available")]
    NoDetections,

    /// The drawing did not plausibly indicate any detected object.
    #[error("drawing does not indicate any detected object")]
    NoMatch,

    /// Several objects fit the drawing and the caller did not pick one.
    #[error("drawing matches {} objects; a selection is required", .resolution.len())]
    AmbiguousSelection {
        /// The candidates on offer, in [`Selection::Pick`] index order.
        ///
        /// [`Selection::Pick`]: crate::workflow::Selection::Pick
        resolution: Resolution,
    },

    /// A mask was applied to an image of a different size.
    ///
    /// Masks must be rebuilt from rescaled coordinates first; this is a
    /// programming error, not a runtime condition.
    #[error("mask is {mask} but image is {image}")]
    MaskDimensionMismatch {
        /// Mask size.
        mask: Dimensions,
        /// Image size.
        image: Dimensions,
    },

    /// A crop, mask or placement had no area left after clamping.
    #[error("{operation} produced an empty region")]
    ZeroArea {
        /// Operation that produced the empty region.
        operation: &'static str,
    },

    /// The generator could not provide replacement content.
    #[error("replacement content could not be generated: {0}")]
    GeneratorFailure(#[source] CollaboratorError),

    /// The replacement image could not be segmented.
    #[error("replacement segmentation failed: {0}")]
    SegmentationOfReplacementFailed(String),

    /// The run was cancelled between two states.
    #[error("workflow cancelled")]
    Cancelled,
}
