//! blinkgate-core: biometric verification engine for attendance check-in.
//!
//! Combines an active liveness check (deliberate double blink, tracked through
//! the eye aspect ratio of facial landmarks) with a face identity check (cosine
//! similarity against enrolled embeddings). Inference backends, frame capture
//! and persistence are external collaborators reached through the traits in
//! [`adapters`].

pub mod adapters;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod outcome;
pub mod probe;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use adapters::{
    AttendanceSink, EmbeddingExtractor, EnrollmentStore, FrameSource, FrameSourceError,
    InferenceError, LandmarkDetection, LandmarkExtractor, StoreFault,
};
pub use landmarks::{LandmarkLayout, FACE_MESH_LAYOUT};
pub use liveness::{LivenessConfig, LivenessDetector, LivenessError, LivenessResult, SessionHandle};
pub use matcher::{CosineMatchEngine, MatchEngine, MatchError};
pub use orchestrator::{cancel_pair, CancelHandle, CancelSignal, CheckInConfig, CheckInError, CheckInOrchestrator};
pub use outcome::{FailureReason, VerificationMethod, VerificationOutcome};
pub use types::{
    BlinkEvent, EnrollmentRecord, FaceCrop, FaceEmbedding, Frame, LandmarkSet, LivenessPolicy,
    MatchResult, Point,
};
