//! Seams to the outside world: inference backends, frame capture and
//! persistence. The daemon provides ONNX, image-sequence and SQLite
//! implementations; tests provide fakes.

use crate::outcome::VerificationOutcome;
use crate::types::{EnrollmentRecord, FaceCrop, FaceEmbedding, Frame, LandmarkSet};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameSourceError {
    #[error("failed to start frame source: {0}")]
    Start(String),
    #[error("failed to read frame: {0}")]
    Read(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreFault {
    #[error("enrollment store unavailable: {0}")]
    Unavailable(String),
}

/// Result of running the landmark model on one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum LandmarkDetection {
    Face(LandmarkSet),
    NoFace,
    MultipleFaces(usize),
}

/// A stream of frames, e.g. a camera or a recorded sequence.
///
/// `stop` must be idempotent; it is called on every exit path of a check-in,
/// including after the stream has ended on its own.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), FrameSourceError>;

    /// Blocks until the next frame. `Ok(None)` means the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError>;

    fn stop(&mut self);

    /// Live sources produce frames in real time and tolerate dropping; a
    /// recorded source is paced by its consumer instead.
    fn is_live(&self) -> bool;
}

/// Facial landmark detection. Implementations may block; callers run them on
/// a blocking worker.
pub trait LandmarkExtractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> Result<LandmarkDetection, InferenceError>;
}

/// Face embedding extraction.
pub trait EmbeddingExtractor: Send + Sync {
    fn embed(&self, face: &FaceCrop) -> Result<FaceEmbedding, InferenceError>;

    /// Version tag stamped on every embedding this extractor produces.
    fn model_version(&self) -> &str;

    fn is_ready(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// `Ok(None)` when the user has no enrollment.
    async fn get_enrollment(&self, user_id: &str) -> Result<Option<EnrollmentRecord>, StoreFault>;
}

#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn persist_attendance(&self, outcome: &VerificationOutcome) -> Result<(), StoreFault>;
}
