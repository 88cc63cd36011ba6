//! roomswap-bench: CLI tool for workflow experimentation and diagnostics.
//!
//! Runs one detection-to-replacement workflow from files on disk, printing
//! detailed per-state diagnostics. Detector and generator output is
//! replayed from recorded files, so fusion thresholds, intention weights
//! and removal parameters can be tuned without any model service running.
//!
//! - Detector dumps are JSON arrays of detector payloads, in photo pixel
//!   coordinates, given as `SOURCE=FILE`.
//! - The drawing is a JSON array of `{"x": .., "y": ..}` points.
//! - The replacement is any image file; `--replacement-detections`
//!   replays a segmenter run on it.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin roomswap-bench -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use futures::FutureExt;
use futures::executor::block_on;
use futures::future::{self, BoxFuture};
use roomswap_pipeline::diagnostics::{Clock, WorkflowDiagnostics};
use roomswap_pipeline::geometry::Scale;
use roomswap_pipeline::{
    CollaboratorError, DetectedObject, DetectionPayload, Detector, DetectorBatch, DetectorSource,
    Dimensions, DrawingPath, Generator, Orchestrator, PipelineConfig, PipelineError, RawDetection,
    ResampleFilter, ResultSink, RgbaImage, RunSummary, Selection, WorkflowRequest, WorkflowState,
};

/// Workflow parameter experimentation and diagnostics for roomswap.
///
/// Replays recorded detector and generator output against a photo and
/// prints per-state timing and count diagnostics.
#[derive(Parser)]
#[command(name = "roomswap-bench", version)]
struct Cli {
    /// Path to the input photo (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Recorded detector output as SOURCE=FILE (repeatable).
    ///
    /// SOURCE is a detector name such as `instance-segmenter`,
    /// `architectural-segmenter` or `object-classifier`.
    #[arg(long = "detections", value_name = "SOURCE=FILE", value_parser = parse_detector_arg)]
    detections: Vec<(DetectorSource, PathBuf)>,

    /// Drawing path as a JSON array of points. Omit to target the whole
    /// image.
    #[arg(long)]
    path: Option<PathBuf>,

    /// Size of the surface the path was drawn on, as WIDTHxHEIGHT.
    #[arg(long, value_parser = parse_dimensions)]
    canvas: Option<Dimensions>,

    /// Pick this candidate when the drawing is ambiguous.
    #[arg(long)]
    pick: Option<usize>,

    /// Replacement image returned by the generator. Omit for a
    /// removal-only run.
    #[arg(long)]
    replacement: Option<PathBuf>,

    /// Replacement prompt recorded in the run summary.
    #[arg(long, default_value = "replacement")]
    prompt: String,

    /// The replacement image already contains only the new object.
    #[arg(long)]
    isolated: bool,

    /// Recorded segmenter output for the replacement image.
    #[arg(long)]
    replacement_detections: Option<PathBuf>,

    /// Detection acceptance threshold.
    #[arg(long, default_value_t = roomswap_pipeline::FusionConfig::DEFAULT_ACCEPTANCE_THRESHOLD)]
    acceptance_threshold: f64,

    /// Minimum intention score.
    #[arg(long, default_value_t = roomswap_pipeline::IntentConfig::DEFAULT_MIN_SCORE)]
    min_score: f64,

    /// Lead required for a single candidate to win outright.
    #[arg(long, default_value_t = roomswap_pipeline::IntentConfig::DEFAULT_TIE_BREAK_MARGIN)]
    tie_break_margin: f64,

    /// Background fill blur sigma.
    #[arg(long, default_value_t = roomswap_pipeline::RemovalConfig::DEFAULT_BLUR_SIGMA)]
    blur_sigma: f32,

    /// Mask dilation radius in pixels.
    #[arg(long, default_value_t = roomswap_pipeline::RemovalConfig::DEFAULT_DILATION)]
    dilation: u8,

    /// Working resolution (max dimension in pixels of the detection image).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_WORKING_RESOLUTION, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    working_resolution: u32,

    /// Resampling filter (nearest, triangle, catmull-rom, lanczos3).
    #[arg(long, value_enum, default_value_t = Filter::Triangle)]
    resample_filter: Filter,

    /// Attempts per collaborator call.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_COLLABORATOR_ATTEMPTS, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    attempts: u32,

    /// Write the final image (or the partial result of a failed run) as PNG.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

/// Resampling filter selection.
#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    /// Nearest-neighbor (fastest, blocky).
    Nearest,
    /// Bilinear interpolation (fast, decent quality).
    Triangle,
    /// Bicubic Catmull-Rom (moderate, good quality).
    CatmullRom,
    /// Lanczos with 3 lobes (slowest, sharpest).
    Lanczos3,
}

fn parse_detector_arg(s: &str) -> Result<(DetectorSource, PathBuf), String> {
    let (source, file) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=FILE, got {s:?}"))?;
    if file.is_empty() {
        return Err(format!("missing file in {s:?}"));
    }
    Ok((DetectorSource::from(source), PathBuf::from(file)))
}

fn parse_dimensions(s: &str) -> Result<Dimensions, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let side = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid size {v:?}: {e}"))
    };
    Ok(Dimensions::new(side(w)?, side(h)?))
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.  Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    let mut config = PipelineConfig {
        working_resolution: cli.working_resolution,
        collaborator_attempts: cli.attempts,
        resample_filter: match cli.resample_filter {
            Filter::Nearest => ResampleFilter::Nearest,
            Filter::Triangle => ResampleFilter::Triangle,
            Filter::CatmullRom => ResampleFilter::CatmullRom,
            Filter::Lanczos3 => ResampleFilter::Lanczos3,
        },
        ..PipelineConfig::default()
    };
    config.fusion.acceptance_threshold = cli.acceptance_threshold;
    config.intent.min_score = cli.min_score;
    config.intent.tie_break_margin = cli.tie_break_margin;
    config.removal.blur_sigma = cli.blur_sigma;
    config.removal.dilation = cli.dilation;
    Ok(config)
}

/// Detector that replays recorded output.
///
/// Recordings are in the coordinates of the image they were made on and
/// are rescaled to whatever image the workflow sends.
struct ReplayDetector {
    source: DetectorSource,
    can_segment: bool,
    recorded_on: Dimensions,
    raw: Vec<RawDetection>,
}

impl ReplayDetector {
    fn load(source: DetectorSource, path: &Path, recorded_on: Dimensions) -> Result<Self, String> {
        let bytes =
            std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        let raw = serde_json::from_slice::<DetectionPayload>(&bytes)
            .map_err(|e| format!("Error parsing detections in {}: {e}", path.display()))?
            .into_objects();
        Ok(Self {
            can_segment: raw.iter().any(|r| r.can_segment),
            source,
            recorded_on,
            raw,
        })
    }
}

impl Detector for ReplayDetector {
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
        let batch =
            DetectorBatch::from_raw(self.source.clone(), self.can_segment, self.raw.clone());
        let result = Scale::between(self.recorded_on, Dimensions::of(image))
            .map(|scale| batch.rescaled(scale).detections)
            .map_err(|e| CollaboratorError::Failed(e.to_string()));
        future::ready(result).boxed()
    }
}

/// Generator that always returns the same image.
struct ReplayGenerator {
    image: RgbaImage,
    isolated: bool,
}

impl Generator for ReplayGenerator {
    fn generate<'a>(
        &'a self,
        _prompt: &'a str,
        _context: Option<&'a RgbaImage>,
    ) -> BoxFuture<'a, Result<RgbaImage, CollaboratorError>> {
        future::ready(Ok(self.image.clone())).boxed()
    }

    fn isolates_content(&self) -> bool {
        self.isolated
    }
}

/// Sink writing the final image as PNG.
struct PngSink {
    path: PathBuf,
}

impl ResultSink for PngSink {
    fn store(&self, image: &RgbaImage, summary: &RunSummary) -> Result<(), CollaboratorError> {
        write_png(&self.path, image).map_err(CollaboratorError::Failed)?;
        eprintln!(
            "Output written to {} ({}, run {:016x})",
            self.path.display(),
            summary.dimensions,
            summary.fingerprint,
        );
        Ok(())
    }
}

fn write_png(path: &Path, image: &RgbaImage) -> Result<(), String> {
    let png = roomswap_pipeline::decode::encode_png(image).map_err(|e| e.to_string())?;
    std::fs::write(path, &png).map_err(|e| format!("Error writing {}: {e}", path.display()))
}

fn load_image(path: &Path) -> Result<RgbaImage, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    roomswap_pipeline::decode::decode(&bytes).map_err(|e| format!("{}: {e}", path.display()))
}

fn load_path(path: &Path) -> Result<DrawingPath, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| format!("Error parsing drawing path in {}: {e}", path.display()))
}

/// Everything loaded from disk before the first run.
struct Inputs {
    image: RgbaImage,
    path: DrawingPath,
    detectors: Vec<ReplayDetector>,
    generator: Option<ReplayGenerator>,
    segmenter: Option<ReplayDetector>,
}

fn load_inputs(cli: &Cli) -> Result<Inputs, String> {
    let image = load_image(&cli.image_path)?;
    let dimensions = Dimensions::of(&image);

    let detectors = cli
        .detections
        .iter()
        .map(|(source, file)| ReplayDetector::load(source.clone(), file, dimensions))
        .collect::<Result<Vec<_>, _>>()?;

    let path = cli
        .path
        .as_deref()
        .map(load_path)
        .transpose()?
        .unwrap_or_default();

    let generator = cli
        .replacement
        .as_deref()
        .map(load_image)
        .transpose()?
        .map(|image| ReplayGenerator {
            image,
            isolated: cli.isolated,
        });

    let segmenter = match (&generator, &cli.replacement_detections) {
        (Some(generator), Some(file)) => Some(ReplayDetector::load(
            DetectorSource::InstanceSegmenter,
            file,
            Dimensions::of(&generator.image),
        )?),
        _ => None,
    };

    Ok(Inputs {
        image,
        path,
        detectors,
        generator,
        segmenter,
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let inputs = match load_inputs(&cli) {
        Ok(inputs) => inputs,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let mut orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    for detector in &inputs.detectors {
        orchestrator = orchestrator.with_detector(detector);
    }
    if let Some(generator) = &inputs.generator {
        orchestrator = orchestrator.with_generator(generator);
    }
    if let Some(segmenter) = &inputs.segmenter {
        orchestrator = orchestrator.with_segmenter(segmenter);
    }
    let sink = cli.output.clone().map(|path| PngSink { path });
    if let Some(sink) = &sink {
        orchestrator = orchestrator.with_sink(sink);
    }

    let mut request = WorkflowRequest::new(inputs.image, inputs.path);
    if let Some(canvas) = cli.canvas {
        request = request.with_canvas(canvas);
    }
    if inputs.generator.is_some() {
        request = request.with_prompt(cli.prompt.clone());
    }
    if let Some(index) = cli.pick {
        request = request.with_selection(Selection::Pick(index));
    }

    eprintln!(
        "Image: {} ({})",
        cli.image_path.display(),
        Dimensions::of(&request.image),
    );
    eprintln!("Detectors: {}", inputs.detectors.len());
    eprintln!("Config: {:#?}", orchestrator.config());
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let (result, diagnostics) =
            block_on(orchestrator.run_with_diagnostics(request.clone(), &StdClock));

        if cli.json {
            match serde_json::to_string_pretty(&diagnostics) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing diagnostics: {e}");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            println!("{}", diagnostics.report());
        }

        if let Err(failure) = result {
            eprintln!("Workflow error: {failure}");
            if let PipelineError::AmbiguousSelection { resolution } = &failure.error {
                for (index, object) in resolution.objects().iter().enumerate() {
                    eprintln!("  --pick {index}: {} ({:.2})", object.name, object.confidence);
                }
            }
            if let (Some(partial), Some(path)) = (&failure.partial, &cli.output) {
                match write_png(path, partial) {
                    Ok(()) => eprintln!("Partial result written to {}", path.display()),
                    Err(e) => eprintln!("{e}"),
                }
            }
            return ExitCode::FAILURE;
        }

        all_diagnostics.push(diagnostics);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[WorkflowDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-state means.
    println!();
    println!("{:<28} {:>12}", "State", "Mean (ms)");
    println!("{}", "-".repeat(44));

    let states = [
        WorkflowState::Detecting,
        WorkflowState::ResolvingIntention,
        WorkflowState::Removing,
        WorkflowState::AwaitingReplacementContent,
        WorkflowState::Segmenting,
        WorkflowState::Compositing,
    ];

    for state in states {
        let state_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| d.state(state))
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .collect();

        if state_durations.is_empty() {
            continue;
        }

        let state_mean = state_durations.iter().sum::<f64>() / state_durations.len() as f64;
        println!("{:<28} {state_mean:>10.3}ms", state.to_string());
    }
}
