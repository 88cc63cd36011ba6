//! End-to-end workflow scenarios against in-memory collaborators.

#![allow(clippy::unwrap_used)]

use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::executor::block_on;
use futures::future::{self, BoxFuture};
use image::Rgba;

use roomswap_pipeline::diagnostics::Clock;
use roomswap_pipeline::{
    BoundingBox, CancelToken, CollaboratorError, DetectedObject, Detector, DetectorSource,
    Dimensions, DrawingPath, Generator, Orchestrator, PipelineConfig, PipelineError, Point,
    Polygon, Resolution, ResultSink, RgbaImage, RunSummary, Selection, WorkflowRequest,
    WorkflowState,
};

const WALL: Rgba<u8> = Rgba([120, 120, 120, 255]);
const RED: Rgba<u8> = Rgba([200, 30, 30, 255]);
const GREEN: Rgba<u8> = Rgba([20, 200, 20, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

// ───────────────────────── fakes ─────────────────────────

struct FakeDetector {
    source: DetectorSource,
    can_segment: bool,
    detections: Vec<DetectedObject>,
    fail: bool,
    calls: AtomicU32,
    seen: Mutex<Option<Dimensions>>,
    cancel_on_call: Option<CancelToken>,
}

impl FakeDetector {
    fn new(source: DetectorSource, can_segment: bool, detections: Vec<DetectedObject>) -> Self {
        Self {
            source,
            can_segment,
            detections,
            fail: false,
            calls: AtomicU32::new(0),
            seen: Mutex::new(None),
            cancel_on_call: None,
        }
    }

    fn failing(source: DetectorSource) -> Self {
        Self {
            fail: true,
            ..Self::new(source, false, Vec::new())
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for FakeDetector {
    fn source(&self) -> DetectorSource {
        self.source.clone()
    }

    fn can_segment(&self) -> bool {
        self.can_segment
    }

    fn detect<'a>(
        &'a self,
        image: &'a RgbaImage,
    ) -> BoxFuture<'a, Result<Vec<DetectedObject>, CollaboratorError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some(Dimensions::of(image));
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let result = if self.fail {
            Err(CollaboratorError::Timeout)
        } else {
            Ok(self.detections.clone())
        };
        future::ready(result).boxed()
    }
}

struct FakeGenerator {
    content: Option<RgbaImage>,
    isolates: bool,
    calls: AtomicU32,
}

impl FakeGenerator {
    fn returning(content: RgbaImage, isolates: bool) -> Self {
        Self {
            content: Some(content),
            isolates,
            calls: AtomicU32::new(0),
        }
    }

    fn broken() -> Self {
        Self {
            content: None,
            isolates: false,
            calls: AtomicU32::new(0),
        }
    }
}

impl Generator for FakeGenerator {
    fn generate<'a>(
        &'a self,
        _prompt: &'a str,
        context: Option<&'a RgbaImage>,
    ) -> BoxFuture<'a, Result<RgbaImage, CollaboratorError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(context.is_some());
        let result = self
            .content
            .clone()
            .ok_or_else(|| CollaboratorError::Failed("model offline".to_owned()));
        future::ready(result).boxed()
    }

    fn isolates_content(&self) -> bool {
        self.isolates
    }
}

#[derive(Default)]
struct RecordingSink {
    stored: Mutex<Vec<RunSummary>>,
    reject: bool,
}

impl ResultSink for RecordingSink {
    fn store(&self, _image: &RgbaImage, summary: &RunSummary) -> Result<(), CollaboratorError> {
        self.stored.lock().unwrap().push(summary.clone());
        if self.reject {
            Err(CollaboratorError::Failed("disk full".to_owned()))
        } else {
            Ok(())
        }
    }
}

/// Advances one millisecond per reading.
#[derive(Default)]
struct TickClock(Cell<u64>);

impl Clock for TickClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        let t = self.0.get() + 1;
        self.0.set(t);
        t
    }

    fn elapsed(&self, since: &u64) -> Duration {
        Duration::from_millis(self.now() - since)
    }
}

// ───────────────────────── scene ─────────────────────────

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Point> {
    vec![
        Point::new(x0, y0),
        Point::new(x1, y0),
        Point::new(x1, y1),
        Point::new(x0, y1),
    ]
}

/// 200x150 wall with a red chair at (50, 40, 40, 40).
fn room() -> RgbaImage {
    RgbaImage::from_fn(200, 150, |x, y| {
        if (50..90).contains(&x) && (40..80).contains(&y) {
            RED
        } else {
            WALL
        }
    })
}

fn chair() -> DetectedObject {
    DetectedObject::new(
        "chair",
        0.9,
        BoundingBox::new(50.0, 40.0, 40.0, 40.0),
        DetectorSource::InstanceSegmenter,
    )
    .with_polygon(Polygon::new(square(50.0, 40.0, 90.0, 80.0)))
}

fn lamp() -> DetectedObject {
    DetectedObject::new(
        "lamp",
        0.8,
        BoundingBox::new(150.0, 20.0, 20.0, 60.0),
        DetectorSource::ObjectClassifier,
    )
}

fn segmenter_for_room() -> FakeDetector {
    FakeDetector::new(DetectorSource::InstanceSegmenter, true, vec![chair()])
}

fn classifier_for_room() -> FakeDetector {
    FakeDetector::new(DetectorSource::ObjectClassifier, false, vec![lamp()])
}

fn around_chair() -> DrawingPath {
    DrawingPath::new(square(45.0, 35.0, 95.0, 85.0))
}

/// 50x50 white image with a green square at (10..40, 10..40).
fn generated() -> RgbaImage {
    RgbaImage::from_fn(50, 50, |x, y| {
        if (10..40).contains(&x) && (10..40).contains(&y) {
            GREEN
        } else {
            WHITE
        }
    })
}

/// Segmenter that outlines the green square of [`generated`].
fn replacement_segmenter() -> FakeDetector {
    FakeDetector::new(
        DetectorSource::InstanceSegmenter,
        true,
        vec![
            DetectedObject::new(
                "armchair",
                0.7,
                BoundingBox::new(10.0, 10.0, 30.0, 30.0),
                DetectorSource::InstanceSegmenter,
            )
            .with_polygon(Polygon::new(square(10.0, 10.0, 40.0, 40.0))),
        ],
    )
}

fn close(actual: Rgba<u8>, expected: Rgba<u8>, tolerance: u8) -> bool {
    actual
        .0
        .iter()
        .zip(expected.0.iter())
        .all(|(a, e)| a.abs_diff(*e) <= tolerance)
}

// ───────────────────────── scenarios ─────────────────────────

#[test]
fn replacement_run_swaps_the_drawn_object() {
    let segmenter = segmenter_for_room();
    let classifier = classifier_for_room();
    let generator = FakeGenerator::returning(generated(), false);
    let isolator = replacement_segmenter();
    let sink = RecordingSink::default();

    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_detector(&classifier)
        .with_generator(&generator)
        .with_segmenter(&isolator)
        .with_sink(&sink);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a green armchair");
    let result = block_on(orchestrator.run(request)).unwrap();

    assert!(result.replaced);
    assert!(!result.degraded);
    assert_eq!(result.target.name, "chair");

    // The removed chair is gone from the cleaned photo.
    assert!(close(*result.cleaned.get_pixel(70, 60), WALL, 2));
    // The isolated green object fills the chair's box.
    assert!(close(*result.image.get_pixel(51, 41), GREEN, 2));
    assert!(close(*result.image.get_pixel(88, 78), GREEN, 2));
    // Outside the box nothing changed.
    assert_eq!(*result.image.get_pixel(10, 10), WALL);
    assert_eq!(*result.image.get_pixel(160, 50), WALL);

    let stored = sink.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, WorkflowState::Done);
    assert_eq!(stored[0].fingerprint, result.fingerprint);
    assert_eq!(stored[0].prompt.as_deref(), Some("a green armchair"));
    assert_eq!(stored[0].dimensions, Dimensions::new(200, 150));
}

#[test]
fn removal_only_run_stops_after_cleaning() {
    let segmenter = segmenter_for_room();
    let generator = FakeGenerator::returning(generated(), true);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator);

    let result = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair()))).unwrap();

    assert!(!result.replaced);
    assert_eq!(result.image, result.cleaned);
    assert!(close(*result.image.get_pixel(70, 60), WALL, 2));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn ambiguous_drawing_needs_a_pick() {
    let couch = DetectedObject::new(
        "couch",
        0.9,
        BoundingBox::new(52.0, 42.0, 38.0, 38.0),
        DetectorSource::InstanceSegmenter,
    );
    let segmenter = FakeDetector::new(
        DetectorSource::InstanceSegmenter,
        true,
        vec![chair(), couch],
    );
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter);

    let failure = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair())))
        .err()
        .unwrap();
    assert_eq!(failure.state, WorkflowState::ResolvingIntention);
    assert_eq!(failure.partial.as_ref(), Some(&room()));
    let PipelineError::AmbiguousSelection { resolution } = &failure.error else {
        unreachable!("expected an ambiguous selection, got {:?}", failure.error);
    };
    assert!(matches!(resolution, Resolution::Ambiguous(_)));
    let offered: Vec<&str> = resolution.objects().iter().map(|o| o.name.as_str()).collect();
    assert_eq!(offered.len(), 2);
    assert!(offered.contains(&"chair") && offered.contains(&"couch"));

    let index = offered.iter().position(|&name| name == "couch").unwrap();
    let picked =
        WorkflowRequest::new(room(), around_chair()).with_selection(Selection::Pick(index));
    let result = block_on(orchestrator.run(picked)).unwrap();
    assert_eq!(result.target.name, "couch");
}

#[test]
fn empty_drawing_with_one_object_targets_it() {
    let segmenter = segmenter_for_room();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter);
    let result =
        block_on(orchestrator.run(WorkflowRequest::new(room(), DrawingPath::default()))).unwrap();
    assert_eq!(result.target.name, "chair");
}

#[test]
fn drawing_far_from_everything_is_no_match() {
    let segmenter = segmenter_for_room();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter);
    let request = WorkflowRequest::new(
        room(),
        DrawingPath::new(square(150.0, 110.0, 190.0, 145.0)),
    );
    let failure = block_on(orchestrator.run(request)).err().unwrap();
    assert_eq!(failure.state, WorkflowState::ResolvingIntention);
    assert!(matches!(failure.error, PipelineError::NoMatch));
    // Nothing was touched; the caller still gets the photo back.
    assert_eq!(failure.partial, Some(room()));
}

#[test]
fn generator_failure_returns_cleaned_partial() {
    let segmenter = segmenter_for_room();
    let generator = FakeGenerator::broken();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a lamp");
    let failure = block_on(orchestrator.run(request)).err().unwrap();

    assert_eq!(failure.state, WorkflowState::AwaitingReplacementContent);
    assert!(matches!(
        failure.error,
        PipelineError::GeneratorFailure(CollaboratorError::Failed(_))
    ));
    let partial = failure.partial.unwrap();
    assert_eq!(Dimensions::of(&partial), Dimensions::new(200, 150));
    assert!(close(*partial.get_pixel(70, 60), WALL, 2));
    assert_eq!(
        generator.calls.load(Ordering::SeqCst),
        PipelineConfig::DEFAULT_COLLABORATOR_ATTEMPTS
    );
}

#[test]
fn all_detectors_failing_is_no_detections() {
    let first = FakeDetector::failing(DetectorSource::InstanceSegmenter);
    let second = FakeDetector::failing(DetectorSource::ObjectClassifier);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&first)
        .with_detector(&second);

    let failure = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair())))
        .err()
        .unwrap();
    assert_eq!(failure.state, WorkflowState::Detecting);
    assert!(matches!(failure.error, PipelineError::NoDetections));
    assert_eq!(failure.partial, Some(room()));
    assert_eq!(first.calls(), PipelineConfig::DEFAULT_COLLABORATOR_ATTEMPTS);
    assert_eq!(second.calls(), PipelineConfig::DEFAULT_COLLABORATOR_ATTEMPTS);
}

#[test]
fn one_failing_detector_is_tolerated() {
    let segmenter = segmenter_for_room();
    let broken = FakeDetector::failing(DetectorSource::ArchitecturalSegmenter);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&broken)
        .with_detector(&segmenter);

    let (result, diagnostics) = block_on(orchestrator.run_with_diagnostics(
        WorkflowRequest::new(room(), around_chair()),
        &TickClock::default(),
    ));
    assert_eq!(result.unwrap().target.name, "chair");
    let detecting = diagnostics.state(WorkflowState::Detecting).unwrap();
    assert!(matches!(
        detecting.metrics,
        roomswap_pipeline::diagnostics::StateMetrics::Detecting {
            detectors: 2,
            failed: 1,
            ..
        }
    ));
}

#[test]
fn cancelled_before_start_fails_at_detection() {
    let segmenter = segmenter_for_room();
    let token = CancelToken::new();
    token.cancel();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_cancel_token(token);

    let failure = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair())))
        .err()
        .unwrap();
    assert_eq!(failure.state, WorkflowState::Detecting);
    assert!(matches!(failure.error, PipelineError::Cancelled));
    assert_eq!(failure.partial, Some(room()));
    assert_eq!(segmenter.calls(), 0);
}

#[test]
fn cancellation_is_honoured_at_the_next_state() {
    let token = CancelToken::new();
    let segmenter = FakeDetector {
        cancel_on_call: Some(token.clone()),
        ..segmenter_for_room()
    };
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_cancel_token(token);

    let failure = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair())))
        .err()
        .unwrap();
    assert_eq!(failure.state, WorkflowState::ResolvingIntention);
    assert!(matches!(failure.error, PipelineError::Cancelled));
}

#[test]
fn missing_segmenter_composites_full_image_as_degraded() {
    let segmenter = segmenter_for_room();
    let generator = FakeGenerator::returning(generated(), false);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a plant");
    let result = block_on(orchestrator.run(request)).unwrap();
    assert!(result.replaced);
    assert!(result.degraded);
    // The generator's white background is composited too.
    assert!(close(*result.image.get_pixel(51, 41), WHITE, 2));
    assert!(close(*result.image.get_pixel(70, 60), GREEN, 2));
}

#[test]
fn failing_segmenter_falls_back_to_full_image() {
    let segmenter = segmenter_for_room();
    let generator = FakeGenerator::returning(generated(), false);
    let isolator = FakeDetector::failing(DetectorSource::InstanceSegmenter);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator)
        .with_segmenter(&isolator);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a plant");
    let result = block_on(orchestrator.run(request)).unwrap();
    assert!(result.degraded);
    assert_eq!(isolator.calls(), PipelineConfig::DEFAULT_COLLABORATOR_ATTEMPTS);
}

#[test]
fn isolating_generator_skips_segmentation() {
    let segmenter = segmenter_for_room();
    let transparent = RgbaImage::from_fn(30, 30, |_, _| GREEN);
    let generator = FakeGenerator::returning(transparent, true);
    let isolator = replacement_segmenter();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator)
        .with_segmenter(&isolator);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a cactus");
    let result = block_on(orchestrator.run(request)).unwrap();
    assert!(!result.degraded);
    assert_eq!(isolator.calls(), 0);
    assert!(close(*result.image.get_pixel(70, 60), GREEN, 2));
}

#[test]
fn detections_on_working_copy_map_back_to_photo() {
    let working_chair = DetectedObject::new(
        "chair",
        0.9,
        BoundingBox::new(25.0, 20.0, 20.0, 20.0),
        DetectorSource::InstanceSegmenter,
    );
    let segmenter = FakeDetector::new(DetectorSource::InstanceSegmenter, true, vec![working_chair]);
    let config = PipelineConfig {
        working_resolution: 100,
        ..PipelineConfig::default()
    };
    let orchestrator = Orchestrator::new(config).unwrap().with_detector(&segmenter);

    let result = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair()))).unwrap();

    assert_eq!(*segmenter.seen.lock().unwrap(), Some(Dimensions::new(100, 75)));
    let b = result.target.bounding_box;
    assert!((b.x - 50.0).abs() < 1e-9 && (b.y - 40.0).abs() < 1e-9);
    assert!((b.width - 40.0).abs() < 1e-9 && (b.height - 40.0).abs() < 1e-9);
}

#[test]
fn drawing_on_a_larger_canvas_is_rescaled() {
    let segmenter = segmenter_for_room();
    let classifier = classifier_for_room();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_detector(&classifier);

    let on_canvas = DrawingPath::new(square(90.0, 70.0, 190.0, 170.0));
    let request = WorkflowRequest::new(room(), on_canvas).with_canvas(Dimensions::new(400, 300));
    let result = block_on(orchestrator.run(request)).unwrap();
    assert_eq!(result.target.name, "chair");
}

#[test]
fn sink_failure_does_not_fail_the_run() {
    let segmenter = segmenter_for_room();
    let sink = RecordingSink {
        reject: true,
        ..RecordingSink::default()
    };
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_sink(&sink);

    let result = block_on(orchestrator.run(WorkflowRequest::new(room(), around_chair())));
    assert!(result.is_ok());
    assert_eq!(sink.stored.lock().unwrap().len(), 1);
}

#[test]
fn diagnostics_cover_every_state_of_a_replacement_run() {
    let segmenter = segmenter_for_room();
    let generator = FakeGenerator::returning(generated(), false);
    let isolator = replacement_segmenter();
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&segmenter)
        .with_generator(&generator)
        .with_segmenter(&isolator);

    let request = WorkflowRequest::new(room(), around_chair()).with_prompt("a green armchair");
    let (result, diagnostics) =
        block_on(orchestrator.run_with_diagnostics(request, &TickClock::default()));
    assert!(result.is_ok());

    let order: Vec<WorkflowState> = diagnostics.states.iter().map(|s| s.state).collect();
    assert_eq!(
        order,
        vec![
            WorkflowState::Detecting,
            WorkflowState::ResolvingIntention,
            WorkflowState::Removing,
            WorkflowState::AwaitingReplacementContent,
            WorkflowState::Segmenting,
            WorkflowState::Compositing,
        ]
    );
    assert_eq!(diagnostics.outcome, WorkflowState::Done);
    assert!(diagnostics.failed_in.is_none());
    assert!(diagnostics.states.iter().all(|s| s.duration > Duration::ZERO));
    assert!(diagnostics.total_duration > Duration::ZERO);
    assert!(diagnostics.report().contains("placed 40x40 at (50,40)"));
}

#[test]
fn failed_run_still_reports_diagnostics() {
    let first = FakeDetector::failing(DetectorSource::InstanceSegmenter);
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .unwrap()
        .with_detector(&first);
    let (result, diagnostics) = block_on(orchestrator.run_with_diagnostics(
        WorkflowRequest::new(room(), around_chair()),
        &TickClock::default(),
    ));
    assert!(result.is_err());
    assert_eq!(diagnostics.outcome, WorkflowState::Failed);
    assert_eq!(diagnostics.failed_in, Some(WorkflowState::Detecting));
    assert!(diagnostics.states.is_empty());
    assert_eq!(diagnostics.summary.pixel_count, 200 * 150);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let mut config = PipelineConfig::default();
    config.intent.min_score = 1.5;
    assert!(matches!(
        Orchestrator::new(config),
        Err(PipelineError::InvalidConfig(_))
    ));
}
