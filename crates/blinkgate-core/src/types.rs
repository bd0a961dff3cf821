use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Blinks a user must complete unless their enrollment says otherwise.
pub const DEFAULT_REQUIRED_BLINKS: u32 = 2;

/// A landmark point in frame pixel coordinates.
///
/// `z` carries the model-relative depth some landmark models emit; the eye
/// geometry only uses the image plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    /// Euclidean distance in the image plane.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Facial landmarks for exactly one detected face.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn get(&self, index: usize) -> Option<Point> {
        self.points.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounds `(min_x, min_y, max_x, max_y)` over all points.
    pub fn bounds(&self) -> Option<(f32, f32, f32, f32)> {
        let first = self.points.first()?;
        let init = (first.x, first.y, first.x, first.y);
        Some(self.points.iter().fold(init, |(x0, y0, x1, y1), p| {
            (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y))
        }))
    }
}

/// A captured RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Offset from the start of the stream. Strictly increasing within a session.
    pub timestamp: Duration,
    pub sequence: u32,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(timestamp: Duration, sequence: u32, image: RgbImage) -> Self {
        Self {
            timestamp,
            sequence,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Face region cut out of a probe frame; the input to embedding extraction.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    /// Sequence number of the frame the crop came from.
    pub source_sequence: u32,
}

/// Identity embedding tagged with the model that produced it.
///
/// Embeddings from different model versions live in unrelated vector spaces
/// and must never be compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub values: Vec<f32>,
    pub model_version: String,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Per-user liveness requirements stored alongside the enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessPolicy {
    pub required_blinks: u32,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            required_blinks: DEFAULT_REQUIRED_BLINKS,
        }
    }
}

/// Stored identity reference for one user.
///
/// Holds one or more reference embeddings, all produced by `model_version`.
/// Read-only during verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub user_id: String,
    pub embeddings: Vec<FaceEmbedding>,
    pub model_version: String,
    pub liveness: LivenessPolicy,
}

impl EnrollmentRecord {
    pub fn new(
        user_id: impl Into<String>,
        model_version: impl Into<String>,
        embeddings: Vec<FaceEmbedding>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            embeddings,
            model_version: model_version.into(),
            liveness: LivenessPolicy::default(),
        }
    }

    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }
}

/// Outcome of comparing a probe against an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Best cosine similarity across the enrolled references, in [-1, 1].
    pub score: f32,
    pub accepted: bool,
    pub threshold: f32,
    /// Index of the reference embedding that produced `score`.
    pub best_index: usize,
}

/// One completed blink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkEvent {
    /// Timestamp of the frame where the eyes dropped below the close threshold.
    pub start: Duration,
    /// Timestamp of the frame where the eyes rose above the reopen threshold.
    pub end: Duration,
}

impl BlinkEvent {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}
