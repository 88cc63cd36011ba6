//! Detector payloads and per-detector result batches.
//!
//! Detector services answer with objects shaped like [`RawDetection`]: a
//! corner-plus-extent box, a confidence already normalized to `[0, 1]`,
//! and optionally a flat segmentation contour. The objects arrive either
//! as a bare list or inside the `/detect` envelope; [`DetectionPayload`]
//! accepts both.
//! [`RawDetection::into_detected`] turns that payload into the canonical
//! [`DetectedObject`]; [`DetectorBatch`] groups one detector's output for
//! fusion.

use serde::{Deserialize, Serialize};

use crate::geometry::Scale;
use crate::types::{BoundingBox, DetectedObject, DetectorSource, Polygon};

/// One object as reported on the wire by a detector service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDetection {
    /// Class label.
    pub name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Box width.
    pub width: f64,
    /// Box height.
    pub height: f64,
    /// Model class index, when reported. Services send it snake_case.
    #[serde(rename = "class_id", default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
    /// Flat `[x0, y0, x1, y1, ...]` contour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Vec<f64>>,
    /// Whether the service claims the contour is usable.
    #[serde(default)]
    pub can_segment: bool,
}

impl RawDetection {
    /// Convert into a [`DetectedObject`] attributed to `source`.
    ///
    /// The contour is kept only when the service flagged it usable and
    /// it has at least three vertices.
    #[must_use]
    pub fn into_detected(self, source: DetectorSource) -> DetectedObject {
        let object = DetectedObject::new(
            self.name,
            self.confidence,
            BoundingBox::new(self.x, self.y, self.width, self.height),
            source,
        );
        match self.segmentation {
            Some(flat) if self.can_segment => object.with_polygon(Polygon::from_flat(&flat)),
            _ => object,
        }
    }
}

/// A `/detect` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetectionPayload {
    /// Plain list of objects.
    Bare(Vec<RawDetection>),
    /// Service envelope; only `objects` is used.
    Wrapped {
        /// Reported objects.
        objects: Vec<RawDetection>,
        /// Model that served the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_used: Option<String>,
        /// Object count as reported by the service.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_detections: Option<usize>,
    },
}

impl DetectionPayload {
    /// The reported objects, whichever shape they came in.
    #[must_use]
    pub fn into_objects(self) -> Vec<RawDetection> {
        match self {
            Self::Bare(objects) | Self::Wrapped { objects, .. } => objects,
        }
    }
}

/// Everything one detector reported for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorBatch {
    /// Reporting detector.
    pub source: DetectorSource,
    /// Whether the detector produces outlines. Segment-capable batches
    /// take priority during fusion.
    pub can_segment: bool,
    /// Detections, in the detector's own order.
    pub detections: Vec<DetectedObject>,
}

impl DetectorBatch {
    /// Create a batch.
    #[must_use]
    pub const fn new(
        source: DetectorSource,
        can_segment: bool,
        detections: Vec<DetectedObject>,
    ) -> Self {
        Self {
            source,
            can_segment,
            detections,
        }
    }

    /// Build a batch from wire payloads.
    #[must_use]
    pub fn from_raw(source: DetectorSource, can_segment: bool, raw: Vec<RawDetection>) -> Self {
        let detections = raw
            .into_iter()
            .map(|r| r.into_detected(source.clone()))
            .collect();
        Self::new(source, can_segment, detections)
    }

    /// Copy of this batch with every box and polygon mapped through
    /// `scale`. Used to bring detections made on a downsampled working
    /// image back to the original resolution.
    #[must_use]
    pub fn rescaled(&self, scale: Scale) -> Self {
        let detections = self
            .detections
            .iter()
            .map(|d| DetectedObject {
                bounding_box: scale.apply_box(&d.bounding_box),
                polygon: d
                    .polygon
                    .as_ref()
                    .map(|p| Polygon::new(p.points().iter().map(|&pt| scale.apply(pt)).collect())),
                ..d.clone()
            })
            .collect();
        Self::new(self.source.clone(), self.can_segment, detections)
    }
}
