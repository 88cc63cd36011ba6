//! Detection fusion: merge several detectors' outputs into one
//! de-duplicated, capability-tagged object list.
//!
//! # Algorithm
//!
//! 1. **Priority:** batches from segment-capable detectors come first;
//!    ties keep input order.
//! 2. **Acceptance:** detections at or below the acceptance threshold are
//!    dropped, whichever detector reported them.
//! 3. **Primary batch:** every remaining detection of the highest-priority
//!    batch is accepted as-is.
//! 4. **Lower priority:** each remaining detection is compared against
//!    everything accepted so far. A spatial index narrows the comparison
//!    to intersecting boxes; a detection whose IoU with any of them
//!    reaches the same-name or different-name threshold is a duplicate
//!    and is dropped.
//! 5. **Tagging:** surviving lower-priority detections without an outline
//!    are tagged [`Capability::Redetectable`] when the capability map
//!    knows their class, [`Capability::BoundingBoxOnly`] otherwise.
//!
//! Detections are only ever dropped or re-tagged; fields are never
//! merged across detectors.

use std::collections::BTreeMap;

use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::detection::DetectorBatch;
use crate::geometry::iou;
use crate::types::{BoundingBox, Capability, DetectedObject};

/// Segmenter classes commonly found in room photos, mapped to themselves.
const SEGMENTER_CLASSES: &[&str] = &[
    "bed",
    "bench",
    "book",
    "bottle",
    "bowl",
    "chair",
    "clock",
    "couch",
    "cup",
    "dining table",
    "laptop",
    "microwave",
    "oven",
    "potted plant",
    "refrigerator",
    "sink",
    "toilet",
    "tv",
    "vase",
];

/// Classifier vocabulary that differs from the segmenter's.
const ALIASES: &[(&str, &str)] = &[
    ("armchair", "chair"),
    ("fridge", "refrigerator"),
    ("monitor", "tv"),
    ("plant", "potted plant"),
    ("sofa", "couch"),
    ("table", "dining table"),
    ("television", "tv"),
];

/// Table translating class names from any detector's vocabulary into the
/// polygon-capable segmenter's vocabulary.
///
/// Keys are lowercase. A name missing from the table has no segmenter
/// equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMap(BTreeMap<String, String>);

impl CapabilityMap {
    /// An empty table: nothing is re-detectable and names are compared
    /// only after lowercasing.
    #[must_use]
    pub const fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Add or replace one entry.
    #[must_use]
    pub fn with(mut self, name: &str, segmenter_class: &str) -> Self {
        self.0
            .insert(normalize(name), segmenter_class.trim().to_lowercase());
        self
    }

    /// The segmenter class `name` maps to, if any.
    #[must_use]
    pub fn segmenter_class(&self, name: &str) -> Option<&str> {
        self.0.get(&normalize(name)).map(String::as_str)
    }

    /// Name used to compare detections across vocabularies: the mapped
    /// segmenter class, or the lowercased name when unmapped.
    #[must_use]
    pub fn canonical(&self, name: &str) -> String {
        let key = normalize(name);
        match self.0.get(&key) {
            Some(mapped) => mapped.clone(),
            None => key,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CapabilityMap {
    fn default() -> Self {
        let identity = SEGMENTER_CLASSES.iter().map(|&c| (c, c));
        identity
            .chain(ALIASES.iter().copied())
            .fold(Self::empty(), |map, (name, class)| map.with(name, class))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Counts describing what fusion kept and why it dropped the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionReport {
    /// Batches considered.
    pub batches: usize,
    /// Detections across all batches.
    pub received: usize,
    /// Detections dropped for low confidence.
    pub below_threshold: usize,
    /// Lower-priority detections dropped as duplicates.
    pub duplicates: usize,
    /// Detections in the output.
    pub accepted: usize,
    /// Output detections tagged [`Capability::Redetectable`].
    pub redetectable: usize,
    /// Output detections tagged [`Capability::BoundingBoxOnly`].
    pub bounding_box_only: usize,
}

/// Output of [`fuse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedDetections {
    /// De-duplicated, tagged detections in priority order.
    pub objects: Vec<DetectedObject>,
    /// Fusion counts.
    pub report: FusionReport,
}

type IndexedBox = GeomWithData<Rectangle<[f64; 2]>, usize>;

fn envelope(b: &BoundingBox) -> ([f64; 2], [f64; 2]) {
    ([b.x, b.y], [b.right(), b.bottom()])
}

/// Merge detector batches into one canonical list.
///
/// An empty input (or one where every detection is below threshold)
/// yields an empty list; deciding whether that is an error is the
/// caller's business.
#[must_use]
pub fn fuse(batches: &[DetectorBatch], config: &FusionConfig) -> FusedDetections {
    let mut order: Vec<&DetectorBatch> = batches.iter().collect();
    // Stable: equal-priority batches keep their input order.
    order.sort_by_key(|b| !b.can_segment);

    let mut report = FusionReport {
        batches: batches.len(),
        received: batches.iter().map(|b| b.detections.len()).sum(),
        ..FusionReport::default()
    };

    let map = &config.capability_map;
    let mut accepted: Vec<DetectedObject> = Vec::new();
    let mut canonical_names: Vec<String> = Vec::new();
    let mut index: RTree<IndexedBox> = RTree::new();

    for (rank, batch) in order.iter().enumerate() {
        for detection in &batch.detections {
            if detection.confidence <= config.acceptance_threshold {
                report.below_threshold += 1;
                continue;
            }
            let canonical = map.canonical(&detection.name);

            let tagged = if rank == 0 {
                detection.clone()
            } else {
                let (lo, hi) = envelope(&detection.bounding_box);
                let duplicate = index
                    .locate_in_envelope_intersecting(&AABB::from_corners(lo, hi))
                    .any(|entry| {
                        let other = &accepted[entry.data];
                        let threshold = if canonical_names[entry.data] == canonical {
                            config.same_name_overlap
                        } else {
                            config.different_name_overlap
                        };
                        iou(&detection.bounding_box, &other.bounding_box) >= threshold
                    });
                if duplicate {
                    log::debug!(
                        "fusion: dropping duplicate {} from {}",
                        detection.name,
                        batch.source
                    );
                    report.duplicates += 1;
                    continue;
                }
                tag_secondary(detection, map)
            };

            match tagged.capability {
                Capability::Redetectable { .. } => report.redetectable += 1,
                Capability::BoundingBoxOnly => report.bounding_box_only += 1,
                Capability::Segmentable => {}
            }
            let (lo, hi) = envelope(&tagged.bounding_box);
            index.insert(GeomWithData::new(
                Rectangle::from_corners(lo, hi),
                accepted.len(),
            ));
            canonical_names.push(canonical);
            accepted.push(tagged);
        }
    }

    report.accepted = accepted.len();
    FusedDetections {
        objects: accepted,
        report,
    }
}

fn tag_secondary(detection: &DetectedObject, map: &CapabilityMap) -> DetectedObject {
    if detection.polygon.is_some() {
        return detection.tagged(Capability::Segmentable);
    }
    match map.segmenter_class(&detection.name) {
        Some(class) => detection.tagged(Capability::Redetectable {
            segmenter_class: class.to_owned(),
        }),
        None => detection.tagged(Capability::BoundingBoxOnly),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{DetectorSource, Polygon};

    fn boxed(
        name: &str,
        confidence: f64,
        b: BoundingBox,
        source: DetectorSource,
    ) -> DetectedObject {
        DetectedObject::new(name, confidence, b, source)
    }

    fn outlined(name: &str, confidence: f64, b: BoundingBox) -> DetectedObject {
        DetectedObject::new(name, confidence, b, DetectorSource::InstanceSegmenter)
            .with_polygon(Polygon::new(b.corners().to_vec()))
    }

    fn segmenter(detections: Vec<DetectedObject>) -> DetectorBatch {
        DetectorBatch::new(DetectorSource::InstanceSegmenter, true, detections)
    }

    fn classifier(detections: Vec<DetectedObject>) -> DetectorBatch {
        DetectorBatch::new(DetectorSource::ObjectClassifier, false, detections)
    }

    #[test]
    fn polygon_detector_wins_over_more_confident_box_detector() {
        // IoU of these boxes is 0.6.
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(25.0, 0.0, 100.0, 100.0);
        assert!((iou(&a, &b) - 0.6).abs() < 1e-12);

        // Classifier listed first to show that order alone does not decide.
        let batches = vec![
            classifier(vec![boxed("table", 0.9, b, DetectorSource::ObjectClassifier)]),
            segmenter(vec![outlined("dining table", 0.5, a)]),
        ];
        let fused = fuse(&batches, &FusionConfig::default());
        assert_eq!(fused.objects.len(), 1);
        let kept = &fused.objects[0];
        assert_eq!(kept.source, DetectorSource::InstanceSegmenter);
        assert!(kept.polygon.is_some());
        assert_eq!(fused.report.duplicates, 1);
    }

    #[test]
    fn low_confidence_is_dropped_everywhere() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let far = BoundingBox::new(500.0, 500.0, 10.0, 10.0);
        let batches = vec![
            segmenter(vec![outlined("chair", 0.35, b)]),
            classifier(vec![boxed("lamp", 0.2, far, DetectorSource::ObjectClassifier)]),
        ];
        let fused = fuse(&batches, &FusionConfig::default());
        assert!(fused.objects.is_empty());
        assert_eq!(fused.report.below_threshold, 2);
    }

    #[test]
    fn same_name_uses_lower_overlap_threshold() {
        // IoU of roughly 0.15: duplicate when names match, kept otherwise.
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(74.0, 0.0, 100.0, 100.0);
        let overlap = iou(&a, &b);
        assert!(overlap > 0.1 && overlap < 0.3);

        let same = fuse(
            &[
                segmenter(vec![outlined("couch", 0.8, a)]),
                classifier(vec![boxed("sofa", 0.8, b, DetectorSource::ObjectClassifier)]),
            ],
            &FusionConfig::default(),
        );
        assert_eq!(same.objects.len(), 1);

        let different = fuse(
            &[
                segmenter(vec![outlined("couch", 0.8, a)]),
                classifier(vec![boxed("lamp", 0.8, b, DetectorSource::ObjectClassifier)]),
            ],
            &FusionConfig::default(),
        );
        assert_eq!(different.objects.len(), 2);
    }

    #[test]
    fn survivors_are_tagged_by_capability_map() {
        let batches = vec![
            segmenter(vec![outlined(
                "bed",
                0.9,
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            )]),
            classifier(vec![
                boxed(
                    "armchair",
                    0.7,
                    BoundingBox::new(100.0, 0.0, 10.0, 10.0),
                    DetectorSource::ObjectClassifier,
                ),
                boxed(
                    "rug",
                    0.7,
                    BoundingBox::new(200.0, 0.0, 10.0, 10.0),
                    DetectorSource::ObjectClassifier,
                ),
            ]),
        ];
        let fused = fuse(&batches, &FusionConfig::default());
        assert_eq!(fused.objects.len(), 3);
        assert_eq!(fused.objects[0].capability, Capability::Segmentable);
        assert_eq!(
            fused.objects[1].capability,
            Capability::Redetectable {
                segmenter_class: "chair".to_owned()
            }
        );
        assert_eq!(fused.objects[2].capability, Capability::BoundingBoxOnly);
        assert_eq!(fused.report.redetectable, 1);
        assert_eq!(fused.report.bounding_box_only, 1);
    }

    #[test]
    fn input_detections_are_not_mutated() {
        let batch = classifier(vec![boxed(
            "sofa",
            0.9,
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            DetectorSource::ObjectClassifier,
        )]);
        let before = batch.clone();
        let _ = fuse(&[segmenter(Vec::new()), batch.clone()], &FusionConfig::default());
        assert_eq!(batch, before);
    }

    #[test]
    fn primary_batch_is_not_deduplicated_against_itself() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let fused = fuse(
            &[segmenter(vec![outlined("cup", 0.9, b), outlined("cup", 0.8, b)])],
            &FusionConfig::default(),
        );
        assert_eq!(fused.objects.len(), 2);
    }

    #[test]
    fn box_only_primary_keeps_its_tag() {
        // With no segment-capable detector, the first batch is primary.
        let fused = fuse(
            &[classifier(vec![boxed(
                "sofa",
                0.9,
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                DetectorSource::ObjectClassifier,
            )])],
            &FusionConfig::default(),
        );
        assert_eq!(fused.objects[0].capability, Capability::BoundingBoxOnly);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let fused = fuse(&[], &FusionConfig::default());
        assert!(fused.objects.is_empty());
        assert_eq!(fused.report, FusionReport::default());
    }

    #[test]
    fn capability_map_canonicalizes_names() {
        let map = CapabilityMap::default();
        assert_eq!(map.canonical(" Sofa "), "couch");
        assert_eq!(map.canonical("Rug"), "rug");
        assert_eq!(map.segmenter_class("TV"), Some("tv"));
        assert_eq!(map.segmenter_class("rug"), None);
        let custom = CapabilityMap::empty().with("Settee", "couch");
        assert_eq!(custom.canonical("settee"), "couch");
        assert_eq!(custom.len(), 1);
    }

    #[test]
    fn capability_map_serializes_as_plain_table() {
        let map = CapabilityMap::empty().with("sofa", "couch");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"sofa":"couch"}"#);
        let back: CapabilityMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
    }
}
