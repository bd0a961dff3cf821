use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a check-in was not (fully) accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoFaceDetected,
    MultipleFacesDetected,
    InsufficientBlinks,
    LowSimilarityScore,
    ModelVersionMismatch,
    EmbeddingDimensionMismatch,
    SessionTimeout,
    NotEnrolled,
    Cancelled,
}

impl FailureReason {
    /// Stable machine-readable code, also used as the stored form.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::NoFaceDetected => "no_face_detected",
            FailureReason::MultipleFacesDetected => "multiple_faces_detected",
            FailureReason::InsufficientBlinks => "insufficient_blinks",
            FailureReason::LowSimilarityScore => "low_similarity_score",
            FailureReason::ModelVersionMismatch => "model_version_mismatch",
            FailureReason::EmbeddingDimensionMismatch => "embedding_dimension_mismatch",
            FailureReason::SessionTimeout => "session_timeout",
            FailureReason::NotEnrolled => "not_enrolled",
            FailureReason::Cancelled => "cancelled",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "no_face_detected" => FailureReason::NoFaceDetected,
            "multiple_faces_detected" => FailureReason::MultipleFacesDetected,
            "insufficient_blinks" => FailureReason::InsufficientBlinks,
            "low_similarity_score" => FailureReason::LowSimilarityScore,
            "model_version_mismatch" => FailureReason::ModelVersionMismatch,
            "embedding_dimension_mismatch" => FailureReason::EmbeddingDimensionMismatch,
            "session_timeout" => FailureReason::SessionTimeout,
            "not_enrolled" => FailureReason::NotEnrolled,
            "cancelled" => FailureReason::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::NoFaceDetected => "no face detected",
            FailureReason::MultipleFacesDetected => "multiple faces detected",
            FailureReason::InsufficientBlinks => "not enough blinks",
            FailureReason::LowSimilarityScore => "face did not match",
            FailureReason::ModelVersionMismatch => "enrollment made with a different model",
            FailureReason::EmbeddingDimensionMismatch => "embedding dimension mismatch",
            FailureReason::SessionTimeout => "session timed out",
            FailureReason::NotEnrolled => "user is not enrolled",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Which checks passed, as recorded on an attendance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Both,
    Face,
    Blink,
    None,
}

impl VerificationMethod {
    pub fn from_checks(face: bool, liveness: bool) -> Self {
        match (face, liveness) {
            (true, true) => VerificationMethod::Both,
            (true, false) => VerificationMethod::Face,
            (false, true) => VerificationMethod::Blink,
            (false, false) => VerificationMethod::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::Both => "both",
            VerificationMethod::Face => "face",
            VerificationMethod::Blink => "blink",
            VerificationMethod::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "both" => Some(VerificationMethod::Both),
            "face" => Some(VerificationMethod::Face),
            "blink" => Some(VerificationMethod::Blink),
            "none" => Some(VerificationMethod::None),
            _ => None,
        }
    }
}

/// Final result of one check-in attempt.
///
/// `overall_accepted` holds only when both checks passed and the attempt was
/// not cancelled. `reasons` lists every failure observed, in detection order,
/// without duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub user_id: String,
    pub face_accepted: bool,
    pub liveness_accepted: bool,
    pub overall_accepted: bool,
    pub reasons: Vec<FailureReason>,
    pub score: Option<f32>,
    pub threshold: f32,
    pub blink_count: usize,
    pub required_blinks: u32,
    pub frames_processed: usize,
    pub frames_dropped: u64,
    pub completed_at: DateTime<Utc>,
}

impl VerificationOutcome {
    pub fn method(&self) -> VerificationMethod {
        VerificationMethod::from_checks(self.face_accepted, self.liveness_accepted)
    }

    pub fn has_reason(&self, reason: FailureReason) -> bool {
        self.reasons.contains(&reason)
    }
}

/// Accumulates evaluation results; failure reasons are never short-circuited.
#[derive(Debug)]
pub(crate) struct OutcomeBuilder {
    user_id: String,
    threshold: f32,
    required_blinks: u32,
    face_accepted: bool,
    liveness_accepted: bool,
    cancelled: bool,
    reasons: Vec<FailureReason>,
    score: Option<f32>,
    blink_count: usize,
    frames_processed: usize,
    frames_dropped: u64,
}

impl OutcomeBuilder {
    pub(crate) fn new(user_id: &str, threshold: f32, required_blinks: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            threshold,
            required_blinks,
            face_accepted: false,
            liveness_accepted: false,
            cancelled: false,
            reasons: Vec::new(),
            score: None,
            blink_count: 0,
            frames_processed: 0,
            frames_dropped: 0,
        }
    }

    pub(crate) fn reason(&mut self, reason: FailureReason) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    pub(crate) fn liveness(&mut self, blink_count: usize) {
        self.blink_count = blink_count;
        self.liveness_accepted = blink_count >= self.required_blinks as usize;
        if !self.liveness_accepted {
            self.reason(FailureReason::InsufficientBlinks);
        }
    }

    /// Partial count for attempts that end before evaluation.
    pub(crate) fn blinks_only(&mut self, blink_count: usize) {
        self.blink_count = blink_count;
    }

    pub(crate) fn face_score(&mut self, score: f32, accepted: bool) {
        self.score = Some(score);
        self.face_accepted = accepted;
        if !accepted {
            self.reason(FailureReason::LowSimilarityScore);
        }
    }

    pub(crate) fn cancelled(&mut self) {
        self.cancelled = true;
        self.reason(FailureReason::Cancelled);
    }

    pub(crate) fn frames(&mut self, processed: usize, dropped: u64) {
        self.frames_processed = processed;
        self.frames_dropped = dropped;
    }

    pub(crate) fn build(self) -> VerificationOutcome {
        let overall_accepted = self.face_accepted && self.liveness_accepted && !self.cancelled;
        VerificationOutcome {
            user_id: self.user_id,
            face_accepted: self.face_accepted,
            liveness_accepted: self.liveness_accepted,
            overall_accepted,
            reasons: self.reasons,
            score: self.score,
            threshold: self.threshold,
            blink_count: self.blink_count,
            required_blinks: self.required_blinks,
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_requires_both() {
        let mut b = OutcomeBuilder::new("alice", 0.6, 2);
        b.liveness(2);
        b.face_score(0.91, true);
        let outcome = b.build();
        assert!(outcome.overall_accepted);
        assert!(outcome.reasons.is_empty());
        assert_eq!(outcome.method(), VerificationMethod::Both);

        let mut b = OutcomeBuilder::new("alice", 0.6, 2);
        b.liveness(1);
        b.face_score(0.91, true);
        let outcome = b.build();
        assert!(!outcome.overall_accepted);
        assert_eq!(outcome.reasons, vec![FailureReason::InsufficientBlinks]);
        assert_eq!(outcome.method(), VerificationMethod::Face);
    }

    #[test]
    fn test_reasons_accumulate_without_duplicates() {
        let mut b = OutcomeBuilder::new("alice", 0.6, 2);
        b.reason(FailureReason::SessionTimeout);
        b.liveness(0);
        b.face_score(0.2, false);
        b.reason(FailureReason::SessionTimeout);
        let outcome = b.build();
        assert_eq!(
            outcome.reasons,
            vec![
                FailureReason::SessionTimeout,
                FailureReason::InsufficientBlinks,
                FailureReason::LowSimilarityScore,
            ]
        );
        assert_eq!(outcome.method(), VerificationMethod::None);
    }

    #[test]
    fn test_cancel_overrides_acceptance() {
        let mut b = OutcomeBuilder::new("alice", 0.6, 2);
        b.liveness(3);
        b.face_score(0.95, true);
        b.cancelled();
        let outcome = b.build();
        assert!(!outcome.overall_accepted);
        assert!(outcome.has_reason(FailureReason::Cancelled));
    }

    #[test]
    fn test_reason_codes_roundtrip() {
        let all = [
            FailureReason::NoFaceDetected,
            FailureReason::MultipleFacesDetected,
            FailureReason::InsufficientBlinks,
            FailureReason::LowSimilarityScore,
            FailureReason::ModelVersionMismatch,
            FailureReason::EmbeddingDimensionMismatch,
            FailureReason::SessionTimeout,
            FailureReason::NotEnrolled,
            FailureReason::Cancelled,
        ];
        for reason in all {
            assert_eq!(FailureReason::from_code(reason.code()), Some(reason));
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.code()));
        }
        assert_eq!(FailureReason::from_code("bogus"), None);
    }

    #[test]
    fn test_method_strings() {
        for m in [
            VerificationMethod::Both,
            VerificationMethod::Face,
            VerificationMethod::Blink,
            VerificationMethod::None,
        ] {
            assert_eq!(VerificationMethod::parse(m.as_str()), Some(m));
        }
        assert_eq!(VerificationMethod::from_checks(false, true), VerificationMethod::Blink);
    }
}
