//! Workflow diagnostics: timing and metrics for each state of a run.
//!
//! These diagnostics are permanent instrumentation for threshold tuning
//! and collaborator profiling. [`Orchestrator::run_with_diagnostics`]
//! collects them alongside the workflow result, successful or not.
//!
//! The pipeline crate never reads a clock itself: callers pass a
//! [`Clock`] implementation, so the core stays free of platform time
//! APIs. [`NullClock`] records zero durations.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.
//!
//! [`Orchestrator::run_with_diagnostics`]: crate::workflow::Orchestrator::run_with_diagnostics

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fusion::FusionReport;
use crate::workflow::WorkflowState;

/// Source of monotonic timestamps.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// Current timestamp.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] that always reports zero elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullClock;

impl Clock for NullClock {
    type Instant = ();

    fn now(&self) {}

    fn elapsed(&self, _since: &()) -> Duration {
        Duration::ZERO
    }
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDiagnostics {
    /// Completed states, in execution order.
    pub states: Vec<StateDiagnostics>,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// [`WorkflowState::Done`] or [`WorkflowState::Failed`].
    pub outcome: WorkflowState,
    /// State the run failed in, if it failed.
    pub failed_in: Option<WorkflowState>,
    /// Failure message, if it failed.
    pub error: Option<String>,
    /// Run-level summary.
    pub summary: WorkflowSummary,
}

/// Diagnostics for one completed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDiagnostics {
    /// Which state.
    pub state: WorkflowState,
    /// Wall-clock duration of this state (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// State-specific metrics.
    pub metrics: StateMetrics,
}

/// State-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateMetrics {
    /// Detection and fusion.
    Detecting {
        /// Detectors queried.
        detectors: usize,
        /// Detectors that failed after retries.
        failed: usize,
        /// Width of the image sent to detectors.
        working_width: u32,
        /// Height of the image sent to detectors.
        working_height: u32,
        /// Whether the detection image was downsampled.
        downsampled: bool,
        /// Fusion counts.
        fusion: FusionReport,
    },
    /// Intention resolution.
    ResolvingIntention {
        /// Points in the drawn path.
        path_points: usize,
        /// Resolution outcome label.
        resolution: String,
        /// Objects offered by the resolution.
        candidates: usize,
        /// Score of the best candidate, when scored.
        top_score: Option<f64>,
    },
    /// Removal of the target.
    Removing {
        /// Class of the removed object.
        target: String,
        /// Whether the mask followed an outline rather than a box.
        outlined: bool,
        /// Pixels selected by the (undilated) mask.
        mask_pixels: u64,
        /// Dilation radius applied before filling.
        dilation: u8,
        /// Fill blur sigma.
        sigma: f32,
    },
    /// Replacement content retrieval.
    AwaitingReplacementContent {
        /// Generated image width.
        width: u32,
        /// Generated image height.
        height: u32,
        /// Whether the generator isolates its content itself.
        isolated: bool,
    },
    /// Segmentation of the replacement.
    Segmenting {
        /// Whether segmentation actually ran.
        attempted: bool,
        /// Whether the full image is used because segmentation failed.
        degraded: bool,
        /// Width of the content that will be composited.
        width: u32,
        /// Height of the content that will be composited.
        height: u32,
    },
    /// Final composite.
    Compositing {
        /// Left edge of the placement.
        x: u32,
        /// Top edge of the placement.
        y: u32,
        /// Placement width.
        width: u32,
        /// Placement height.
        height: u32,
    },
}

/// High-level summary for the entire run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Stable hash of the run's inputs.
    pub fingerprint: u64,
}

impl WorkflowDiagnostics {
    /// Diagnostics for `state`, if it completed.
    #[must_use]
    pub fn state(&self, state: WorkflowState) -> Option<&StateDiagnostics> {
        self.states.iter().find(|s| s.state == state)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Workflow Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)  fingerprint {:016x}",
            self.summary.image_width,
            self.summary.image_height,
            self.summary.pixel_count,
            self.summary.fingerprint,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<28} {:>10} {:>10}  {}",
            "State", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.states {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            let name = diag.state.to_string();
            lines.push(format!("{name:<28} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        match (&self.failed_in, &self.error) {
            (Some(state), Some(error)) => {
                lines.push(format!("Outcome: {} in {state}: {error}", self.outcome));
            }
            _ => lines.push(format!("Outcome: {}", self.outcome)),
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format state metrics into a compact detail string.
fn format_metrics(metrics: &StateMetrics) -> String {
    match metrics {
        StateMetrics::Detecting {
            detectors,
            failed,
            working_width,
            working_height,
            downsampled,
            fusion,
        } => {
            let scaled = if *downsampled { " (downsampled)" } else { "" };
            format!(
                "{detectors} detectors ({failed} failed) at {working_width}x{working_height}{scaled}; {} in, {} kept, {} low, {} dup",
                fusion.received, fusion.accepted, fusion.below_threshold, fusion.duplicates,
            )
        }
        StateMetrics::ResolvingIntention {
            path_points,
            resolution,
            candidates,
            top_score,
        } => {
            let score = top_score.map_or_else(String::new, |s| format!(" top={s:.3}"));
            format!("{path_points} pts -> {resolution} ({candidates} candidates){score}")
        }
        StateMetrics::Removing {
            target,
            outlined,
            mask_pixels,
            dilation,
            sigma,
        } => {
            let shape = if *outlined { "outline" } else { "box" };
            format!("{target} ({shape}) {mask_pixels} px, dilate={dilation} sigma={sigma:.1}")
        }
        StateMetrics::AwaitingReplacementContent {
            width,
            height,
            isolated,
        } => {
            let iso = if *isolated { " isolated" } else { "" };
            format!("{width}x{height}{iso}")
        }
        StateMetrics::Segmenting {
            attempted,
            degraded,
            width,
            height,
        } => {
            let how = match (attempted, degraded) {
                (false, false) => "skipped",
                (_, true) => "fallback to full image",
                (true, false) => "isolated",
            };
            format!("{how} -> {width}x{height}")
        }
        StateMetrics::Compositing {
            x,
            y,
            width,
            height,
        } => format!("placed {width}x{height} at ({x},{y})"),
    }
}
