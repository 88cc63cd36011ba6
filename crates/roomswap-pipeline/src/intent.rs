//! Intention resolution: decide which detected object an imprecise
//! hand-drawn path was meant to indicate.
//!
//! Each candidate gets five factors in `[0, 1]`:
//!
//! - **enclosure**: fraction of a `grid_size × grid_size` lattice of cell
//!   centres across the candidate's box that fall inside the path,
//! - **distance**: `1 − |centroid(path) − centre(box)| / diagonal(path)`,
//! - **size**: smaller over larger area of the path bounds and the box,
//! - **confidence**: the detector's own confidence,
//! - **containment**: fraction of the box's four corners inside the path.
//!
//! The score is the weighted mean of the factors. Open paths are closed
//! implicitly by the even-odd test. Scoring has no hidden state, so equal
//! inputs always give equal rankings.

use serde::{Deserialize, Serialize};

use crate::config::IntentConfig;
use crate::geometry::{centroid, path_bounds, point_in_polygon};
use crate::types::{BoundingBox, DetectedObject, DrawingPath, Point, ScoreFactors, ScoredCandidate};

/// Outcome of resolving a drawing against the fused detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "objects", rename_all = "kebab-case")]
pub enum Resolution {
    /// Nothing was drawn; every candidate is returned unchanged, in
    /// input order.
    WholeImage(Vec<DetectedObject>),
    /// One candidate clearly leads.
    Selected(ScoredCandidate),
    /// Several candidates are close; best first.
    Ambiguous(Vec<ScoredCandidate>),
    /// No candidate scored above the minimum.
    NoMatch,
}

impl Resolution {
    /// The resolved objects, best first.
    #[must_use]
    pub fn objects(&self) -> Vec<&DetectedObject> {
        match self {
            Self::WholeImage(objects) => objects.iter().collect(),
            Self::Selected(c) => vec![&c.object],
            Self::Ambiguous(cs) => cs.iter().map(|c| &c.object).collect(),
            Self::NoMatch => Vec::new(),
        }
    }

    /// Number of resolved objects.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::WholeImage(objects) => objects.len(),
            Self::Selected(_) => 1,
            Self::Ambiguous(cs) => cs.len(),
            Self::NoMatch => 0,
        }
    }

    /// Returns `true` for [`NoMatch`](Self::NoMatch) and for an empty
    /// whole-image list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short label for logs and diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WholeImage(_) => "whole-image",
            Self::Selected(_) => "selected",
            Self::Ambiguous(_) => "ambiguous",
            Self::NoMatch => "no-match",
        }
    }
}

/// Scores candidates against a drawing.
#[derive(Debug, Clone, Default)]
pub struct IntentionResolver {
    config: IntentConfig,
}

impl IntentionResolver {
    /// Create a resolver with the given parameters.
    #[must_use]
    pub const fn new(config: IntentConfig) -> Self {
        Self { config }
    }

    /// The resolver's parameters.
    #[must_use]
    pub const fn config(&self) -> &IntentConfig {
        &self.config
    }

    /// Score one candidate against a non-empty path (image coordinates).
    #[must_use]
    pub fn score(&self, path: &[Point], object: &DetectedObject) -> ScoredCandidate {
        let bbox = &object.bounding_box;
        let bounds = path_bounds(path);
        let factors = ScoreFactors {
            enclosure: enclosure(path, bbox, self.config.grid_size),
            distance: closeness(path, &bounds, bbox),
            size: size_similarity(&bounds, bbox),
            confidence: object.confidence.clamp(0.0, 1.0),
            containment: containment(path, bbox),
        };
        let w = &self.config.weights;
        let total = w.total();
        let weighted = w.enclosure * factors.enclosure
            + w.distance * factors.distance
            + w.size * factors.size
            + w.confidence * factors.confidence
            + w.containment * factors.containment;
        let score = if total > 0.0 { weighted / total } else { 0.0 };
        ScoredCandidate {
            object: object.clone(),
            score,
            factors,
        }
    }

    /// Every candidate scoring above `min_score`, best first. Equal
    /// scores keep input order.
    #[must_use]
    pub fn rank(&self, path: &[Point], candidates: &[DetectedObject]) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|c| self.score(path, c))
            .filter(|c| c.score > self.config.min_score)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// Resolve a drawing against the candidates.
    ///
    /// `path` must already be in the candidates' coordinate space.
    #[must_use]
    pub fn resolve(&self, path: &DrawingPath, candidates: &[DetectedObject]) -> Resolution {
        if path.is_empty() {
            return Resolution::WholeImage(candidates.to_vec());
        }
        let mut ranked = self.rank(path.points(), candidates);
        match ranked.len() {
            0 => Resolution::NoMatch,
            1 => Resolution::Selected(ranked.remove(0)),
            _ => {
                let lead = ranked[0].score - ranked[1].score;
                if lead > self.config.tie_break_margin {
                    Resolution::Selected(ranked.remove(0))
                } else {
                    ranked.truncate(self.config.max_ambiguous);
                    Resolution::Ambiguous(ranked)
                }
            }
        }
    }
}

fn enclosure(path: &[Point], bbox: &BoundingBox, grid_size: u32) -> f64 {
    if grid_size == 0 {
        return 0.0;
    }
    let n = f64::from(grid_size);
    let step_x = bbox.width / n;
    let step_y = bbox.height / n;
    let mut inside = 0_u32;
    for row in 0..grid_size {
        let y = step_y.mul_add(f64::from(row) + 0.5, bbox.y);
        for col in 0..grid_size {
            let x = step_x.mul_add(f64::from(col) + 0.5, bbox.x);
            if point_in_polygon(Point::new(x, y), path) {
                inside += 1;
            }
        }
    }
    f64::from(inside) / (n * n)
}

fn closeness(path: &[Point], bounds: &BoundingBox, bbox: &BoundingBox) -> f64 {
    let Some(c) = centroid(path) else {
        return 0.0;
    };
    let distance = c.distance(bbox.center());
    let diagonal = bounds.diagonal();
    if diagonal <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / diagonal).clamp(0.0, 1.0)
}

fn size_similarity(bounds: &BoundingBox, bbox: &BoundingBox) -> f64 {
    let (a, b) = (bounds.area(), bbox.area());
    let larger = a.max(b);
    if larger <= 0.0 {
        0.0
    } else {
        a.min(b) / larger
    }
}

fn containment(path: &[Point], bbox: &BoundingBox) -> f64 {
    let inside = bbox
        .corners()
        .into_iter()
        .filter(|&corner| point_in_polygon(corner, path))
        .count();
    // At most four corners.
    f64::from(u8::try_from(inside).unwrap_or(4)) / 4.0
}
