//! roomswap-pipeline: object removal and replacement for room photos
//! (sans-IO).
//!
//! A run goes:
//! detect (several detectors, fused) -> resolve the user's drawing to an
//! object -> mask and remove it -> request replacement content ->
//! isolate the new object -> composite it where the old one was.
//!
//! This crate has **no I/O dependencies**. Detectors, the generator and
//! the result sink are traits in [`collaborator`]; callers supply them
//! and drive the returned futures on any executor. Time is read through
//! [`diagnostics::Clock`].

pub mod blur;
pub mod collaborator;
pub mod composite;
pub mod config;
pub mod decode;
pub mod detection;
pub mod diagnostics;
pub mod fusion;
pub mod geometry;
pub mod intent;
pub mod mask;
pub mod types;
pub mod workflow;

pub use collaborator::{CancelToken, Detector, Generator, ResultSink, RunSummary};
pub use config::{
    FusionConfig, IntentConfig, IntentWeights, PipelineConfig, RemovalConfig, ResampleFilter,
};
pub use detection::{DetectionPayload, DetectorBatch, RawDetection};
pub use diagnostics::{Clock, NullClock, WorkflowDiagnostics};
pub use fusion::{CapabilityMap, FusedDetections, FusionReport, fuse};
pub use intent::{IntentionResolver, Resolution};
pub use mask::Mask;
pub use types::{
    BoundingBox, Capability, CollaboratorError, DetectedObject, DetectorSource, Dimensions,
    DrawingPath, PipelineError, PixelRect, Point, Polygon, RgbaImage, ScoredCandidate,
};
pub use workflow::{
    Orchestrator, RunFailure, Selection, WorkflowRequest, WorkflowResult, WorkflowState,
};
