//! Contracts for the external services a workflow depends on.
//!
//! Detectors and the generator are asynchronous: they return boxed
//! `Send` futures so any executor can drive them and several detectors
//! can run at once. The result sink is a synchronous, fire-and-forget
//! hand-off. None of these are implemented here.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::types::{CollaboratorError, DetectedObject, DetectorSource, Dimensions, RgbaImage};
use crate::workflow::WorkflowState;

/// An object detector (model service).
pub trait Detector: Send + Sync {
    /// Which detector this is.
    fn source(&self) -> DetectorSource;

    /// Whether its detections carry outlines.
    fn can_segment(&self) -> bool;

    /// Detect objects in `image`. Boxes and outlines are in `image`'s
    /// pixel space, confidences already normalized to `[0, 1]`.
    fn detect<'a>(
        &'a self,
        image: &'a RgbaImage,
    ) -> BoxFuture<'a, Result<Vec<DetectedObject>, CollaboratorError>>;
}

/// A replacement-content generator.
pub trait Generator: Send + Sync {
    /// Produce an image for `prompt`, optionally conditioned on a context
    /// image (the cleaned photo).
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        context: Option<&'a RgbaImage>,
    ) -> BoxFuture<'a, Result<RgbaImage, CollaboratorError>>;

    /// Whether generated images already contain only the new object on a
    /// transparent background. When `false`, the workflow segments the
    /// result before compositing.
    fn isolates_content(&self) -> bool {
        false
    }
}

/// Destination for finished images and their metadata.
pub trait ResultSink: Send + Sync {
    /// Store the final image. Failures are logged by the caller and
    /// otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`CollaboratorError`] if the image could not be stored.
    fn store(&self, image: &RgbaImage, summary: &RunSummary) -> Result<(), CollaboratorError>;
}

/// Metadata handed to the [`ResultSink`] alongside the final image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Stable hash of the run's inputs.
    pub fingerprint: u64,
    /// Size of the final image.
    pub dimensions: Dimensions,
    /// State the run finished in.
    pub state: WorkflowState,
    /// The object that was removed, if any.
    pub target: Option<DetectedObject>,
    /// Replacement prompt, if any.
    pub prompt: Option<String>,
    /// Whether the replacement was composited without isolation.
    pub degraded: bool,
}

/// Cooperative cancellation flag, checked between workflow states.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The running workflow stops at its next state
    /// boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Call `op` up to `attempts` times, returning the first success or the
/// last error.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    label: &str,
    mut op: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                log::debug!("{label}: attempt {attempt}/{attempts} failed: {e}");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
