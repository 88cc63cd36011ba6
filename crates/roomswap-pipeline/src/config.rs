//! Tunable thresholds, weights and filters.
//!
//! Every constant that shapes fusion, intention resolution or removal
//! lives here as an explicit field with a `DEFAULT_*` associated constant,
//! so alternate profiles can be tested side by side. The default values
//! were tuned empirically against a handful of room photos and should be
//! recalibrated against real user drawings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fusion::CapabilityMap;
use crate::types::PipelineError;

/// Detection fusion thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Detections at or below this confidence are dropped.
    pub acceptance_threshold: f64,
    /// IoU at which a same-class lower-priority detection is a duplicate.
    pub same_name_overlap: f64,
    /// IoU at which a different-class lower-priority detection is a
    /// duplicate.
    pub different_name_overlap: f64,
    /// Classifier-to-segmenter vocabulary table.
    pub capability_map: CapabilityMap,
}

impl FusionConfig {
    /// Default [`acceptance_threshold`](Self::acceptance_threshold).
    pub const DEFAULT_ACCEPTANCE_THRESHOLD: f64 = 0.35;
    /// Default [`same_name_overlap`](Self::same_name_overlap).
    pub const DEFAULT_SAME_NAME_OVERLAP: f64 = 0.1;
    /// Default [`different_name_overlap`](Self::different_name_overlap).
    pub const DEFAULT_DIFFERENT_NAME_OVERLAP: f64 = 0.3;
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: Self::DEFAULT_ACCEPTANCE_THRESHOLD,
            same_name_overlap: Self::DEFAULT_SAME_NAME_OVERLAP,
            different_name_overlap: Self::DEFAULT_DIFFERENT_NAME_OVERLAP,
            capability_map: CapabilityMap::default(),
        }
    }
}

/// Weights of the five intention factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentWeights {
    /// Grid samples of the box inside the path.
    pub enclosure: f64,
    /// Path centroid to box centre closeness.
    pub distance: f64,
    /// Area similarity of path bounds and box.
    pub size: f64,
    /// Detector confidence.
    pub confidence: f64,
    /// Box corners inside the path.
    pub containment: f64,
}

impl IntentWeights {
    /// Sum of all weights.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.enclosure + self.distance + self.size + self.confidence + self.containment
    }

    fn all(&self) -> [f64; 5] {
        [
            self.enclosure,
            self.distance,
            self.size,
            self.confidence,
            self.containment,
        ]
    }
}

impl Default for IntentWeights {
    fn default() -> Self {
        Self {
            enclosure: 0.30,
            distance: 0.20,
            size: 0.15,
            confidence: 0.15,
            containment: 0.20,
        }
    }
}

/// Intention resolver parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Factor weights.
    pub weights: IntentWeights,
    /// Samples per axis of the enclosure grid.
    pub grid_size: u32,
    /// Candidates scoring at or below this are excluded.
    pub min_score: f64,
    /// Lead over the runner-up needed for a single selection.
    pub tie_break_margin: f64,
    /// Most candidates returned for an ambiguous drawing.
    pub max_ambiguous: usize,
}

impl IntentConfig {
    /// Default [`grid_size`](Self::grid_size).
    pub const DEFAULT_GRID_SIZE: u32 = 15;
    /// Default [`min_score`](Self::min_score).
    pub const DEFAULT_MIN_SCORE: f64 = 0.3;
    /// Default [`tie_break_margin`](Self::tie_break_margin).
    pub const DEFAULT_TIE_BREAK_MARGIN: f64 = 0.2;
    /// Default [`max_ambiguous`](Self::max_ambiguous).
    pub const DEFAULT_MAX_AMBIGUOUS: usize = 3;
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            weights: IntentWeights::default(),
            grid_size: Self::DEFAULT_GRID_SIZE,
            min_score: Self::DEFAULT_MIN_SCORE,
            tie_break_margin: Self::DEFAULT_TIE_BREAK_MARGIN,
            max_ambiguous: Self::DEFAULT_MAX_AMBIGUOUS,
        }
    }
}

/// Parameters of the blur-based removal fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RemovalConfig {
    /// Gaussian sigma of the background fill. Larger values reach
    /// further for background colour.
    pub blur_sigma: f32,
    /// Pixels the mask is grown by before filling, so anti-aliased
    /// object edges are covered too.
    pub dilation: u8,
}

impl RemovalConfig {
    /// Default [`blur_sigma`](Self::blur_sigma).
    pub const DEFAULT_BLUR_SIGMA: f32 = 12.0;
    /// Default [`dilation`](Self::dilation).
    pub const DEFAULT_DILATION: u8 = 2;
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            blur_sigma: Self::DEFAULT_BLUR_SIGMA,
            dilation: Self::DEFAULT_DILATION,
        }
    }
}

/// Resampling filter used when scaling images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResampleFilter {
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Lanczos with 3 lobes: slowest, sharpest/best for photos.
    Lanczos3,
}

impl ResampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    #[must_use]
    pub const fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            Self::Nearest => image::imageops::FilterType::Nearest,
            Self::Triangle => image::imageops::FilterType::Triangle,
            Self::CatmullRom => image::imageops::FilterType::CatmullRom,
            Self::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Configuration for a full workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Detection fusion thresholds.
    pub fusion: FusionConfig,
    /// Intention resolver parameters.
    pub intent: IntentConfig,
    /// Removal fill parameters.
    pub removal: RemovalConfig,
    /// Filter used to downsample the detection image and to scale
    /// replacement content.
    pub resample_filter: ResampleFilter,
    /// Longest side, in pixels, of the image sent to detectors.
    pub working_resolution: u32,
    /// How many times each collaborator call is attempted.
    pub collaborator_attempts: u32,
}

impl PipelineConfig {
    /// Default [`working_resolution`](Self::working_resolution).
    pub const DEFAULT_WORKING_RESOLUTION: u32 = 1024;
    /// Default [`collaborator_attempts`](Self::collaborator_attempts).
    pub const DEFAULT_COLLABORATOR_ATTEMPTS: u32 = 2;

    /// Check every field against its valid range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(PipelineError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {v}"
                )))
            }
        };
        unit(
            "fusion.acceptance_threshold",
            self.fusion.acceptance_threshold,
        )?;
        unit("fusion.same_name_overlap", self.fusion.same_name_overlap)?;
        unit(
            "fusion.different_name_overlap",
            self.fusion.different_name_overlap,
        )?;
        unit("intent.min_score", self.intent.min_score)?;
        unit("intent.tie_break_margin", self.intent.tie_break_margin)?;

        let weights = self.intent.weights;
        if weights.all().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::InvalidConfig(
                "intent weights must be finite and non-negative".to_owned(),
            ));
        }
        if weights.total() <= 0.0 {
            return Err(PipelineError::InvalidConfig(
                "intent weights must not all be zero".to_owned(),
            ));
        }
        if self.intent.grid_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "intent.grid_size must be at least 1".to_owned(),
            ));
        }
        if self.intent.max_ambiguous == 0 {
            return Err(PipelineError::InvalidConfig(
                "intent.max_ambiguous must be at least 1".to_owned(),
            ));
        }
        if self.removal.blur_sigma.is_nan() || self.removal.blur_sigma <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "removal.blur_sigma must be positive, got {}",
                self.removal.blur_sigma
            )));
        }
        if self.working_resolution == 0 {
            return Err(PipelineError::InvalidConfig(
                "working_resolution must be at least 1".to_owned(),
            ));
        }
        if self.collaborator_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "collaborator_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            intent: IntentConfig::default(),
            removal: RemovalConfig::default(),
            resample_filter: ResampleFilter::default(),
            working_resolution: Self::DEFAULT_WORKING_RESOLUTION,
            collaborator_attempts: Self::DEFAULT_COLLABORATOR_ATTEMPTS,
        }
    }
}
