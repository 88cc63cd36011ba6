//! Replacement workflow as a typestate pipeline.
//!
//! Each stage is a distinct type that can only be advanced forward:
//!
//! ```text
//! Idle ─detect─▶ Detected ─resolve─▶ Resolved ─select─▶ Targeted ─remove─▶ Removed
//!   ─request_replacement─▶ ReplacementReceived ─segment─▶ Segmented ─composite─▶ Composited
//! ```
//!
//! [`Removed::finish`] ends a removal-only run, [`Composited::finish`] a
//! replacement run. Every transition checks the run's [`CancelToken`]
//! first and every failure is a [`RunFailure`] naming the state it
//! happened in, carrying the cleaned image once one exists.
//!
//! [`Orchestrator`] drives the whole chain from a [`WorkflowRequest`];
//! the stage types stay public for callers that want to pause between
//! states, for example to let a user pick from an ambiguous selection.

use std::fmt;
use std::hash::Hasher;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::collaborator::{CancelToken, Detector, Generator, ResultSink, RunSummary, with_retries};
use crate::composite::{crop, extract_masked, insert_scaled, remove_masked};
use crate::config::PipelineConfig;
use crate::decode::downsample;
use crate::detection::DetectorBatch;
use crate::diagnostics::{
    Clock, NullClock, StateDiagnostics, StateMetrics, WorkflowDiagnostics, WorkflowSummary,
};
use crate::fusion::{CapabilityMap, FusedDetections, FusionReport, fuse};
use crate::geometry::{Scale, rescale_points};
use crate::intent::{IntentionResolver, Resolution};
use crate::mask::Mask;
use crate::types::{
    CollaboratorError, DetectedObject, DetectorSource, Dimensions, DrawingPath, PipelineError,
    PixelRect, Point, RgbaImage,
};

/// Where a run is, for logs, diagnostics and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowState {
    /// Nothing has happened yet.
    Idle,
    /// Detectors are running and their results are being fused.
    Detecting,
    /// The drawing is being matched against detections.
    ResolvingIntention,
    /// The target is being masked out and filled.
    Removing,
    /// Waiting for the generator.
    AwaitingReplacementContent,
    /// The new object is being isolated from the generated image.
    Segmenting,
    /// The new object is being placed into the cleaned image.
    Compositing,
    /// The run finished.
    Done,
    /// The run stopped with an error.
    Failed,
}

impl WorkflowState {
    /// Kebab-case name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::ResolvingIntention => "resolving-intention",
            Self::Removing => "removing",
            Self::AwaitingReplacementContent => "awaiting-replacement-content",
            Self::Segmenting => "segmenting",
            Self::Compositing => "compositing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run that stopped early.
#[derive(Debug, thiserror::Error)]
#[error("workflow failed while {state}: {error}")]
pub struct RunFailure {
    /// State the failure happened in.
    pub state: WorkflowState,
    /// What went wrong.
    #[source]
    pub error: PipelineError,
    /// Last usable image: the untouched photo before removal, the
    /// cleaned photo after it.
    pub partial: Option<RgbaImage>,
}

impl RunFailure {
    /// Failure in `state` with an optional partial result.
    #[must_use]
    pub const fn new(
        state: WorkflowState,
        error: PipelineError,
        partial: Option<RgbaImage>,
    ) -> Self {
        Self {
            state,
            error,
            partial,
        }
    }
}

/// How the target is chosen from the resolved candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Selection {
    /// Proceed only if exactly one candidate was resolved.
    #[default]
    Auto,
    /// Take the candidate at this index of the resolved list.
    Pick(usize),
}

/// Final output of a run that reached [`WorkflowState::Done`].
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// The finished image: the composite, or the cleaned photo for a
    /// removal-only run.
    pub image: RgbaImage,
    /// The photo with the target removed.
    pub cleaned: RgbaImage,
    /// The object that was removed.
    pub target: DetectedObject,
    /// Whether replacement content was composited.
    pub replaced: bool,
    /// Whether the replacement was composited without isolation.
    pub degraded: bool,
    /// Stable hash of the run's inputs.
    pub fingerprint: u64,
}

/// Stable hash of a run's inputs.
///
/// Identical pixels, drawing, prompt and configuration always hash to
/// the same value.
#[must_use]
pub fn fingerprint(
    image: &RgbaImage,
    path: &DrawingPath,
    prompt: Option<&str>,
    config: &PipelineConfig,
) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write_u32(image.width());
    hasher.write_u32(image.height());
    hasher.write(image.as_raw());
    hasher.write_usize(path.len());
    for p in path.points() {
        hasher.write_u64(p.x.to_bits());
        hasher.write_u64(p.y.to_bits());
    }
    match prompt {
        Some(prompt) => {
            hasher.write_u8(1);
            hasher.write(prompt.as_bytes());
        }
        None => hasher.write_u8(0),
    }
    hasher.write(format!("{config:?}").as_bytes());
    hasher.finish()
}

/// Shared per-run state carried through every stage.
#[derive(Debug, Clone)]
struct Context {
    config: PipelineConfig,
    cancel: CancelToken,
    fingerprint: u64,
}

impl Context {
    /// Gate into `state`: fails with [`PipelineError::Cancelled`] if the
    /// run was cancelled.
    fn enter(&self, state: WorkflowState, partial: Option<&RgbaImage>) -> Result<(), RunFailure> {
        if self.cancel.is_cancelled() {
            log::info!("run {:016x}: cancelled before {state}", self.fingerprint);
            return Err(RunFailure::new(
                state,
                PipelineError::Cancelled,
                partial.cloned(),
            ));
        }
        log::debug!("run {:016x}: {state}", self.fingerprint);
        Ok(())
    }

    fn summary(
        &self,
        image: &RgbaImage,
        target: &DetectedObject,
        prompt: Option<String>,
        degraded: bool,
    ) -> RunSummary {
        RunSummary {
            fingerprint: self.fingerprint,
            dimensions: Dimensions::of(image),
            state: WorkflowState::Done,
            target: Some(target.clone()),
            prompt,
            degraded,
        }
    }
}

fn deliver(sink: Option<&dyn ResultSink>, image: &RgbaImage, summary: &RunSummary) {
    if let Some(sink) = sink
        && let Err(e) = sink.store(image, summary)
    {
        log::warn!("run {:016x}: result sink failed: {e}", summary.fingerprint);
    }
}

/// A completed stage that reports metrics for the state that produced it.
pub trait WorkflowStage {
    /// The state whose work produced this stage.
    const STATE: WorkflowState;

    /// Metrics describing that work.
    fn metrics(&self) -> StateMetrics;
}

// ───────────────────────── Stage 0: Idle ──────────────────────────────

/// A validated photo waiting for detection.
#[must_use = "workflow stages are consumed by advancing — call .detect() to continue"]
#[derive(Debug)]
pub struct Idle {
    ctx: Context,
    image: RgbaImage,
}

impl Idle {
    /// Start a run on a decoded photo.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` fails
    /// validation, or [`PipelineError::EmptyInput`] if the image has no
    /// pixels.
    pub fn new(image: RgbaImage, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let fingerprint = fingerprint(&image, &DrawingPath::default(), None, &config);
        Self::with_context(
            image,
            Context {
                config,
                cancel: CancelToken::new(),
                fingerprint,
            },
        )
    }

    fn with_context(image: RgbaImage, ctx: Context) -> Result<Self, PipelineError> {
        if Dimensions::of(&image).is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        Ok(Self { ctx, image })
    }

    /// Observe `token` at every following transition.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.ctx.cancel = token;
        self
    }

    /// The photo.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Stable hash of the run's inputs.
    #[must_use]
    pub const fn fingerprint(&self) -> u64 {
        self.ctx.fingerprint
    }

    /// Run every detector concurrently on a working-resolution copy and
    /// fuse whatever they report.
    ///
    /// Each detector is retried up to the configured number of attempts.
    /// A detector that still fails is logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::NoDetections`] if every detector failed
    /// or nothing survived fusion.
    pub async fn detect(self, detectors: &[&dyn Detector]) -> Result<Detected, RunFailure> {
        self.ctx.enter(WorkflowState::Detecting, Some(&self.image))?;
        let fail =
            |error| RunFailure::new(WorkflowState::Detecting, error, Some(self.image.clone()));

        let original = Dimensions::of(&self.image);
        let (working, downsampled) = downsample(
            &self.image,
            self.ctx.config.working_resolution,
            self.ctx.config.resample_filter,
        );
        let working_dimensions = Dimensions::of(&working);
        let scale = Scale::between(working_dimensions, original).map_err(fail)?;

        let attempts = self.ctx.config.collaborator_attempts;
        let working = &working;
        let outcomes = join_all(detectors.iter().map(|&detector| async move {
            let label = format!("detector {}", detector.source());
            let result = with_retries(attempts, &label, || detector.detect(working)).await;
            (detector, result)
        }))
        .await;

        let mut batches = Vec::new();
        let mut failures = Vec::new();
        for (detector, result) in outcomes {
            match result {
                Ok(detections) => {
                    let batch =
                        DetectorBatch::new(detector.source(), detector.can_segment(), detections);
                    batches.push(if scale.is_identity() {
                        batch
                    } else {
                        batch.rescaled(scale)
                    });
                }
                Err(error) => {
                    let unavailable = PipelineError::DetectionUnavailable {
                        detector: detector.source(),
                        error: error.clone(),
                    };
                    log::warn!("run {:016x}: {unavailable}", self.ctx.fingerprint);
                    failures.push((detector.source(), error));
                }
            }
        }

        if batches.is_empty() {
            return Err(fail(PipelineError::NoDetections));
        }
        let fused = fuse(&batches, &self.ctx.config.fusion);
        if fused.objects.is_empty() {
            return Err(fail(PipelineError::NoDetections));
        }
        log::debug!(
            "run {:016x}: fused {} of {} detections",
            self.ctx.fingerprint,
            fused.report.accepted,
            fused.report.received,
        );

        Ok(Detected {
            ctx: self.ctx,
            image: self.image,
            working: working_dimensions,
            downsampled,
            detectors: detectors.len(),
            failures,
            fused,
        })
    }
}

// ───────────────────────── Stage 1: Detected ──────────────────────────

/// Fused detections for the photo.
#[must_use = "workflow stages are consumed by advancing — call .resolve() to continue"]
#[derive(Debug)]
pub struct Detected {
    ctx: Context,
    image: RgbaImage,
    working: Dimensions,
    downsampled: bool,
    detectors: usize,
    failures: Vec<(DetectorSource, CollaboratorError)>,
    fused: FusedDetections,
}

impl Detected {
    /// Fused detections, in original image coordinates.
    #[must_use]
    pub fn objects(&self) -> &[DetectedObject] {
        &self.fused.objects
    }

    /// Fusion counts.
    #[must_use]
    pub const fn report(&self) -> &FusionReport {
        &self.fused.report
    }

    /// Detectors that failed after retries.
    #[must_use]
    pub fn failures(&self) -> &[(DetectorSource, CollaboratorError)] {
        &self.failures
    }

    /// Match a drawing against the detections.
    ///
    /// `path` is in `canvas` coordinates when a canvas is given (the
    /// surface the user drew on), otherwise in image coordinates.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::NoMatch`] if no detection scores
    /// above the minimum, or [`PipelineError::ZeroArea`] for an empty
    /// canvas.
    pub fn resolve(
        self,
        path: &DrawingPath,
        canvas: Option<Dimensions>,
    ) -> Result<Resolved, RunFailure> {
        self.ctx.enter(WorkflowState::ResolvingIntention, Some(&self.image))?;
        let fail = |error| {
            RunFailure::new(
                WorkflowState::ResolvingIntention,
                error,
                Some(self.image.clone()),
            )
        };

        let path = match canvas {
            Some(canvas) => DrawingPath::new(
                rescale_points(path.points(), canvas, Dimensions::of(&self.image))
                    .map_err(fail)?,
            ),
            None => path.clone(),
        };

        let resolution = IntentionResolver::new(self.ctx.config.intent.clone())
            .resolve(&path, &self.fused.objects);
        if matches!(resolution, Resolution::NoMatch) {
            return Err(fail(PipelineError::NoMatch));
        }
        log::debug!(
            "run {:016x}: drawing resolved as {} ({} candidates)",
            self.ctx.fingerprint,
            resolution.kind(),
            resolution.len(),
        );

        Ok(Resolved {
            ctx: self.ctx,
            image: self.image,
            path,
            resolution,
        })
    }
}

impl WorkflowStage for Detected {
    const STATE: WorkflowState = WorkflowState::Detecting;

    fn metrics(&self) -> StateMetrics {
        StateMetrics::Detecting {
            detectors: self.detectors,
            failed: self.failures.len(),
            working_width: self.working.width,
            working_height: self.working.height,
            downsampled: self.downsampled,
            fusion: self.fused.report,
        }
    }
}

// ───────────────────────── Stage 2: Resolved ──────────────────────────

/// The drawing's resolved candidates.
#[must_use = "workflow stages are consumed by advancing — call .select() to continue"]
#[derive(Debug)]
pub struct Resolved {
    ctx: Context,
    image: RgbaImage,
    path: DrawingPath,
    resolution: Resolution,
}

impl Resolved {
    /// How the drawing was resolved.
    #[must_use]
    pub const fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// The drawing in image coordinates.
    #[must_use]
    pub const fn path(&self) -> &DrawingPath {
        &self.path
    }

    /// Choose the object to remove.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::AmbiguousSelection`] if `Auto` meets
    /// more than one candidate or `Pick` is out of range. The error
    /// carries the resolution, so the caller can offer its candidates and
    /// retry with [`Selection::Pick`].
    pub fn select(self, selection: Selection) -> Result<Targeted, RunFailure> {
        let chosen = {
            let candidates = self.resolution.objects();
            match selection {
                Selection::Pick(index) => candidates.get(index).copied(),
                Selection::Auto if candidates.len() == 1 => candidates.first().copied(),
                Selection::Auto => None,
            }
            .cloned()
        };
        let Some(target) = chosen else {
            return Err(RunFailure::new(
                WorkflowState::ResolvingIntention,
                PipelineError::AmbiguousSelection {
                    resolution: self.resolution,
                },
                Some(self.image),
            ));
        };
        log::debug!(
            "run {:016x}: target {} ({:.2})",
            self.ctx.fingerprint,
            target.name,
            target.confidence,
        );
        Ok(Targeted {
            ctx: self.ctx,
            image: self.image,
            target,
        })
    }
}

impl WorkflowStage for Resolved {
    const STATE: WorkflowState = WorkflowState::ResolvingIntention;

    fn metrics(&self) -> StateMetrics {
        let top_score = match &self.resolution {
            Resolution::Selected(c) => Some(c.score),
            Resolution::Ambiguous(cs) => cs.first().map(|c| c.score),
            Resolution::WholeImage(_) | Resolution::NoMatch => None,
        };
        StateMetrics::ResolvingIntention {
            path_points: self.path.len(),
            resolution: self.resolution.kind().to_owned(),
            candidates: self.resolution.len(),
            top_score,
        }
    }
}

// ───────────────────────── Stage 3: Targeted ──────────────────────────

/// A single object chosen for removal.
#[must_use = "workflow stages are consumed by advancing — call .remove() to continue"]
#[derive(Debug)]
pub struct Targeted {
    ctx: Context,
    image: RgbaImage,
    target: DetectedObject,
}

impl Targeted {
    /// The chosen object.
    #[must_use]
    pub const fn target(&self) -> &DetectedObject {
        &self.target
    }

    /// Mask the target (outline when available, box otherwise) and fill
    /// it with background.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::ZeroArea`] if the target covers no
    /// pixels of the photo.
    pub fn remove(self) -> Result<Removed, RunFailure> {
        self.ctx.enter(WorkflowState::Removing, Some(&self.image))?;
        let mask = Mask::for_object(&self.target, Dimensions::of(&self.image));
        let cleaned = remove_masked(&self.image, &mask, &self.ctx.config.removal).map_err(|e| {
            RunFailure::new(WorkflowState::Removing, e, Some(self.image.clone()))
        })?;
        Ok(Removed {
            ctx: self.ctx,
            target: self.target,
            mask,
            cleaned,
        })
    }
}

// ───────────────────────── Stage 4: Removed ───────────────────────────

/// The photo with the target removed.
#[must_use = "workflow stages are consumed by advancing — call .request_replacement() or .finish()"]
#[derive(Debug)]
pub struct Removed {
    ctx: Context,
    target: DetectedObject,
    mask: Mask,
    cleaned: RgbaImage,
}

impl Removed {
    /// The cleaned photo.
    #[must_use]
    pub const fn cleaned(&self) -> &RgbaImage {
        &self.cleaned
    }

    /// The removal mask, before dilation.
    #[must_use]
    pub const fn mask(&self) -> &Mask {
        &self.mask
    }

    /// The removed object.
    #[must_use]
    pub const fn target(&self) -> &DetectedObject {
        &self.target
    }

    /// End a removal-only run, handing the cleaned photo to `sink`.
    pub fn finish(self, sink: Option<&dyn ResultSink>) -> WorkflowResult {
        let summary = self.ctx.summary(&self.cleaned, &self.target, None, false);
        deliver(sink, &self.cleaned, &summary);
        log::info!("run {:016x}: removed {}", self.ctx.fingerprint, self.target.name);
        WorkflowResult {
            image: self.cleaned.clone(),
            cleaned: self.cleaned,
            target: self.target,
            replaced: false,
            degraded: false,
            fingerprint: self.ctx.fingerprint,
        }
    }

    /// Ask `generator` for replacement content, conditioned on the
    /// cleaned photo.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::GeneratorFailure`] if every attempt
    /// fails or the generator returns an empty image. The failure carries
    /// the cleaned photo.
    pub async fn request_replacement(
        self,
        generator: &dyn Generator,
        prompt: &str,
    ) -> Result<ReplacementReceived, RunFailure> {
        self.ctx
            .enter(WorkflowState::AwaitingReplacementContent, Some(&self.cleaned))?;

        let cleaned = &self.cleaned;
        let result = with_retries(self.ctx.config.collaborator_attempts, "generator", || {
            generator.generate(prompt, Some(cleaned))
        })
        .await
        .and_then(|content| {
            if Dimensions::of(&content).is_empty() {
                Err(CollaboratorError::Failed(
                    "generator returned an empty image".to_owned(),
                ))
            } else {
                Ok(content)
            }
        });

        match result {
            Ok(content) => Ok(ReplacementReceived {
                isolated: generator.isolates_content(),
                ctx: self.ctx,
                target: self.target,
                cleaned: self.cleaned,
                prompt: prompt.to_owned(),
                content,
            }),
            Err(e) => Err(RunFailure::new(
                WorkflowState::AwaitingReplacementContent,
                PipelineError::GeneratorFailure(e),
                Some(self.cleaned),
            )),
        }
    }
}

impl WorkflowStage for Removed {
    const STATE: WorkflowState = WorkflowState::Removing;

    fn metrics(&self) -> StateMetrics {
        StateMetrics::Removing {
            target: self.target.name.clone(),
            outlined: self.target.polygon.is_some(),
            mask_pixels: self.mask.selected_count(),
            dilation: self.ctx.config.removal.dilation,
            sigma: self.ctx.config.removal.blur_sigma,
        }
    }
}

// ───────────────────────── Stage 5: ReplacementReceived ───────────────

/// Generated replacement content, not yet isolated.
#[must_use = "workflow stages are consumed by advancing — call .segment() to continue"]
#[derive(Debug)]
pub struct ReplacementReceived {
    ctx: Context,
    target: DetectedObject,
    cleaned: RgbaImage,
    prompt: String,
    content: RgbaImage,
    isolated: bool,
}

impl ReplacementReceived {
    /// The generated image.
    #[must_use]
    pub const fn content(&self) -> &RgbaImage {
        &self.content
    }

    /// Isolate the new object from whatever background the generator
    /// drew around it.
    ///
    /// Skipped when the generator already isolates its content. When no
    /// segmenter is given or segmentation fails, the full generated image
    /// is used and the run is marked degraded.
    ///
    /// # Errors
    ///
    /// Fails only with [`PipelineError::Cancelled`].
    pub async fn segment(self, segmenter: Option<&dyn Detector>) -> Result<Segmented, RunFailure> {
        self.ctx.enter(WorkflowState::Segmenting, Some(&self.cleaned))?;

        if self.isolated {
            return Ok(self.into_segmented(None, false));
        }

        let outcome = match segmenter {
            None => Err(PipelineError::SegmentationOfReplacementFailed(
                "no segmenter available".to_owned(),
            )),
            Some(segmenter) => {
                let content = &self.content;
                with_retries(self.ctx.config.collaborator_attempts, "segmenter", || {
                    segmenter.detect(content)
                })
                .await
                .map_err(|e| PipelineError::SegmentationOfReplacementFailed(e.to_string()))
                .and_then(|detections| {
                    isolate(
                        &self.content,
                        &detections,
                        &self.target,
                        &self.ctx.config.fusion.capability_map,
                    )
                })
            }
        };

        match outcome {
            Ok(isolated) => Ok(self.into_segmented(Some(isolated), false)),
            Err(e) => {
                log::warn!(
                    "run {:016x}: {e}; compositing the full replacement image",
                    self.ctx.fingerprint,
                );
                Ok(self.into_segmented(None, true))
            }
        }
    }

    fn into_segmented(self, isolated: Option<RgbaImage>, degraded: bool) -> Segmented {
        let attempted = !self.isolated;
        Segmented {
            ctx: self.ctx,
            target: self.target,
            cleaned: self.cleaned,
            prompt: self.prompt,
            content: isolated.unwrap_or(self.content),
            attempted,
            degraded,
        }
    }
}

impl WorkflowStage for ReplacementReceived {
    const STATE: WorkflowState = WorkflowState::AwaitingReplacementContent;

    fn metrics(&self) -> StateMetrics {
        StateMetrics::AwaitingReplacementContent {
            width: self.content.width(),
            height: self.content.height(),
            isolated: self.isolated,
        }
    }
}

/// Cut the detection best matching `target` out of `content`, cropped to
/// its outline.
///
/// Only outlined detections qualify. One with the target's canonical
/// class wins over any other; ties go to the higher confidence, then the
/// earlier detection.
fn isolate(
    content: &RgbaImage,
    detections: &[DetectedObject],
    target: &DetectedObject,
    map: &CapabilityMap,
) -> Result<RgbaImage, PipelineError> {
    let wanted = map.canonical(&target.name);
    let best = detections
        .iter()
        .rev()
        .filter(|d| d.polygon.is_some())
        .max_by(|a, b| {
            let a_match = map.canonical(&a.name) == wanted;
            let b_match = map.canonical(&b.name) == wanted;
            a_match
                .cmp(&b_match)
                .then(a.confidence.total_cmp(&b.confidence))
        })
        .ok_or_else(|| {
            PipelineError::SegmentationOfReplacementFailed(
                "no outlined object in the replacement image".to_owned(),
            )
        })?;

    let mask = Mask::for_object(best, Dimensions::of(content));
    let bounds = mask.bounds().ok_or_else(|| {
        PipelineError::SegmentationOfReplacementFailed(format!(
            "outline of {} covers no pixels",
            best.name
        ))
    })?;
    let extracted = extract_masked(content, &mask)?;
    crop(&extracted, &bounds.to_bounding_box())
}

// ───────────────────────── Stage 6: Segmented ─────────────────────────

/// Replacement content ready to composite.
#[must_use = "workflow stages are consumed by advancing — call .composite() to continue"]
#[derive(Debug)]
pub struct Segmented {
    ctx: Context,
    target: DetectedObject,
    cleaned: RgbaImage,
    prompt: String,
    content: RgbaImage,
    attempted: bool,
    degraded: bool,
}

impl Segmented {
    /// The content that will be composited.
    #[must_use]
    pub const fn content(&self) -> &RgbaImage {
        &self.content
    }

    /// Whether the full generated image is used because isolation failed.
    #[must_use]
    pub const fn degraded(&self) -> bool {
        self.degraded
    }

    /// Place the content over the cleaned photo where the target was,
    /// scaled to fit the target's box.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::ZeroArea`] if the target box lies
    /// outside the photo. The failure carries the cleaned photo.
    pub fn composite(self) -> Result<Composited, RunFailure> {
        self.ctx.enter(WorkflowState::Compositing, Some(&self.cleaned))?;

        let placed = self
            .target
            .bounding_box
            .clamp_to(Dimensions::of(&self.cleaned))
            .ok_or(PipelineError::ZeroArea {
                operation: "insertion",
            })
            .and_then(|rect| {
                insert_scaled(
                    &self.cleaned,
                    &self.content,
                    Point::new(f64::from(rect.x), f64::from(rect.y)),
                    rect.dimensions(),
                    self.ctx.config.resample_filter,
                )
                .map(|image| (rect, image))
            });

        match placed {
            Ok((placement, image)) => Ok(Composited {
                ctx: self.ctx,
                target: self.target,
                cleaned: self.cleaned,
                prompt: self.prompt,
                image,
                placement,
                attempted: self.attempted,
                degraded: self.degraded,
                content: Dimensions::of(&self.content),
            }),
            Err(e) => Err(RunFailure::new(
                WorkflowState::Compositing,
                e,
                Some(self.cleaned),
            )),
        }
    }
}

impl WorkflowStage for Segmented {
    const STATE: WorkflowState = WorkflowState::Segmenting;

    fn metrics(&self) -> StateMetrics {
        StateMetrics::Segmenting {
            attempted: self.attempted,
            degraded: self.degraded,
            width: self.content.width(),
            height: self.content.height(),
        }
    }
}

// ───────────────────────── Stage 7: Composited ────────────────────────

/// The finished composite.
#[must_use = "workflow stages are consumed by advancing — call .finish() to complete the run"]
#[derive(Debug)]
pub struct Composited {
    ctx: Context,
    target: DetectedObject,
    cleaned: RgbaImage,
    prompt: String,
    image: RgbaImage,
    placement: PixelRect,
    attempted: bool,
    degraded: bool,
    content: Dimensions,
}

impl Composited {
    /// The composite.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Where the content was placed.
    #[must_use]
    pub const fn placement(&self) -> PixelRect {
        self.placement
    }

    /// End the run, handing the composite to `sink`.
    pub fn finish(self, sink: Option<&dyn ResultSink>) -> WorkflowResult {
        let summary =
            self.ctx
                .summary(&self.image, &self.target, Some(self.prompt), self.degraded);
        deliver(sink, &self.image, &summary);
        log::info!(
            "run {:016x}: replaced {}{}",
            self.ctx.fingerprint,
            self.target.name,
            if self.degraded { " (degraded)" } else { "" },
        );
        log::trace!(
            "run {:016x}: content {} placed at {:?}, segmentation attempted: {}",
            self.ctx.fingerprint,
            self.content,
            self.placement,
            self.attempted,
        );
        WorkflowResult {
            image: self.image,
            cleaned: self.cleaned,
            target: self.target,
            replaced: true,
            degraded: self.degraded,
            fingerprint: self.ctx.fingerprint,
        }
    }
}

impl WorkflowStage for Composited {
    const STATE: WorkflowState = WorkflowState::Compositing;

    fn metrics(&self) -> StateMetrics {
        StateMetrics::Compositing {
            x: self.placement.x,
            y: self.placement.y,
            width: self.placement.width,
            height: self.placement.height,
        }
    }
}

// ───────────────────────── Orchestrator ───────────────────────────────

/// Everything a single run needs from the caller.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// The decoded photo.
    pub image: RgbaImage,
    /// The user's drawing. Empty means "whole image".
    pub path: DrawingPath,
    /// Size of the surface the drawing was made on, if it differs from
    /// the photo.
    pub canvas: Option<Dimensions>,
    /// Replacement prompt. `None` makes the run removal-only.
    pub prompt: Option<String>,
    /// How to choose among several candidates.
    pub selection: Selection,
}

impl WorkflowRequest {
    /// Removal-only request with automatic selection and the drawing in
    /// image coordinates.
    #[must_use]
    pub fn new(image: RgbaImage, path: DrawingPath) -> Self {
        Self {
            image,
            path,
            canvas: None,
            prompt: None,
            selection: Selection::Auto,
        }
    }

    /// The drawing was made on a surface of this size.
    #[must_use]
    pub const fn with_canvas(mut self, canvas: Dimensions) -> Self {
        self.canvas = Some(canvas);
        self
    }

    /// Replace the removed object with generated content for `prompt`.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Use `selection` to choose the target.
    #[must_use]
    pub const fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }
}

struct Recorder<'c, C: Clock> {
    clock: &'c C,
    states: Vec<StateDiagnostics>,
}

impl<C: Clock> Recorder<'_, C> {
    fn record<S: WorkflowStage>(&mut self, stage: &S, since: &C::Instant) {
        self.states.push(StateDiagnostics {
            state: S::STATE,
            duration: self.clock.elapsed(since),
            metrics: stage.metrics(),
        });
    }
}

/// Drives complete runs against a fixed set of collaborators.
pub struct Orchestrator<'a> {
    config: PipelineConfig,
    detectors: Vec<&'a dyn Detector>,
    generator: Option<&'a dyn Generator>,
    segmenter: Option<&'a dyn Detector>,
    sink: Option<&'a dyn ResultSink>,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrator with no collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` fails
    /// validation.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            detectors: Vec::new(),
            generator: None,
            segmenter: None,
            sink: None,
            cancel: CancelToken::new(),
        })
    }

    /// Add a detector. All detectors run concurrently.
    #[must_use]
    pub fn with_detector(mut self, detector: &'a dyn Detector) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Set the replacement generator.
    #[must_use]
    pub fn with_generator(mut self, generator: &'a dyn Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the detector used to isolate generated content.
    #[must_use]
    pub fn with_segmenter(mut self, segmenter: &'a dyn Detector) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// Set the destination for finished images.
    #[must_use]
    pub fn with_sink(mut self, sink: &'a dyn ResultSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancel runs through `token`.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The configuration every run uses.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one request to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] naming the state that failed.
    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowResult, RunFailure> {
        self.run_with_diagnostics(request, &NullClock).await.0
    }

    /// Run one request, timing every state with `clock`.
    ///
    /// Diagnostics are returned whether or not the run succeeded.
    pub async fn run_with_diagnostics<C: Clock>(
        &self,
        request: WorkflowRequest,
        clock: &C,
    ) -> (Result<WorkflowResult, RunFailure>, WorkflowDiagnostics) {
        let start = clock.now();
        let dimensions = Dimensions::of(&request.image);
        let fingerprint = fingerprint(
            &request.image,
            &request.path,
            request.prompt.as_deref(),
            &self.config,
        );

        let mut recorder = Recorder {
            clock,
            states: Vec::new(),
        };
        let result = self.drive(request, fingerprint, &mut recorder).await;

        if let Err(failure) = &result {
            log::info!("run {fingerprint:016x}: {failure}");
        }
        let diagnostics = WorkflowDiagnostics {
            states: recorder.states,
            total_duration: clock.elapsed(&start),
            outcome: if result.is_ok() {
                WorkflowState::Done
            } else {
                WorkflowState::Failed
            },
            failed_in: result.as_ref().err().map(|f| f.state),
            error: result.as_ref().err().map(|f| f.error.to_string()),
            summary: WorkflowSummary {
                image_width: dimensions.width,
                image_height: dimensions.height,
                pixel_count: dimensions.pixel_count(),
                fingerprint,
            },
        };
        (result, diagnostics)
    }

    async fn drive<C: Clock>(
        &self,
        request: WorkflowRequest,
        fingerprint: u64,
        recorder: &mut Recorder<'_, C>,
    ) -> Result<WorkflowResult, RunFailure> {
        let WorkflowRequest {
            image,
            path,
            canvas,
            prompt,
            selection,
        } = request;

        let ctx = Context {
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            fingerprint,
        };
        let idle = Idle::with_context(image, ctx)
            .map_err(|e| RunFailure::new(WorkflowState::Idle, e, None))?;

        let t = recorder.clock.now();
        let detected = idle.detect(&self.detectors).await?;
        recorder.record(&detected, &t);

        let t = recorder.clock.now();
        let resolved = detected.resolve(&path, canvas)?;
        recorder.record(&resolved, &t);
        let targeted = resolved.select(selection)?;

        let t = recorder.clock.now();
        let removed = targeted.remove()?;
        recorder.record(&removed, &t);

        let Some(prompt) = prompt else {
            return Ok(removed.finish(self.sink));
        };
        let Some(generator) = self.generator else {
            return Err(RunFailure::new(
                WorkflowState::AwaitingReplacementContent,
                PipelineError::GeneratorFailure(CollaboratorError::Failed(
                    "no generator configured".to_owned(),
                )),
                Some(removed.cleaned),
            ));
        };

        let t = recorder.clock.now();
        let received = removed.request_replacement(generator, &prompt).await?;
        recorder.record(&received, &t);

        let t = recorder.clock.now();
        let segmented = received.segment(self.segmenter).await?;
        recorder.record(&segmented, &t);

        let t = recorder.clock.now();
        let composited = segmented.composite()?;
        recorder.record(&composited, &t);

        Ok(composited.finish(self.sink))
    }
}
