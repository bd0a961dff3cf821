use crate::types::{EnrollmentRecord, FaceEmbedding, MatchResult};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe model version {probe} does not match enrolled version {enrolled}")]
    ModelVersionMismatch { probe: String, enrolled: String },
    #[error("embedding dimension mismatch: probe {probe}, enrolled {enrolled}")]
    EmbeddingDimensionMismatch { probe: usize, enrolled: usize },
    #[error("enrollment for {0} has no reference embeddings")]
    EmptyEnrollment(String),
    #[error("similarity threshold {0} outside [-1, 1]")]
    InvalidThreshold(f32),
}

/// Compares a probe embedding against a user's enrolled references.
pub trait MatchEngine: Send + Sync {
    fn compare(
        &self,
        probe: &FaceEmbedding,
        enrollment: &EnrollmentRecord,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity clamped to [-1, 1]. Zero vectors score 0.0.
///
/// Accumulates in f64; results within `UNIT_SNAP` of ±1 are reported as
/// exactly ±1 so identical embeddings clear a threshold of 1.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < f64::from(f32::EPSILON) {
        return 0.0;
    }
    let sim = (dot / denom).clamp(-1.0, 1.0);
    if 1.0 - sim.abs() < UNIT_SNAP {
        return sim.signum() as f32;
    }
    sim as f32
}

const UNIT_SNAP: f64 = 1e-6;

/// Best-of-N cosine matcher.
///
/// Every reference is scored, even after one clears the threshold, so the
/// time taken does not reveal which reference matched.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatchEngine;

impl MatchEngine for CosineMatchEngine {
    fn compare(
        &self,
        probe: &FaceEmbedding,
        enrollment: &EnrollmentRecord,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(MatchError::InvalidThreshold(threshold));
        }

        // Version gate comes before any arithmetic.
        if probe.model_version != enrollment.model_version {
            return Err(MatchError::ModelVersionMismatch {
                probe: probe.model_version.clone(),
                enrolled: enrollment.model_version.clone(),
            });
        }
        if let Some(stray) = enrollment
            .embeddings
            .iter()
            .find(|e| e.model_version != probe.model_version)
        {
            return Err(MatchError::ModelVersionMismatch {
                probe: probe.model_version.clone(),
                enrolled: stray.model_version.clone(),
            });
        }

        if enrollment.embeddings.is_empty() {
            return Err(MatchError::EmptyEnrollment(enrollment.user_id.clone()));
        }
        if let Some(bad) = enrollment
            .embeddings
            .iter()
            .find(|e| e.dimension() != probe.dimension())
        {
            return Err(MatchError::EmbeddingDimensionMismatch {
                probe: probe.dimension(),
                enrolled: bad.dimension(),
            });
        }

        let mut best_score = f32::NEG_INFINITY;
        let mut best_index = 0;
        for (i, reference) in enrollment.embeddings.iter().enumerate() {
            let score = cosine_similarity(&probe.values, &reference.values);
            if score > best_score {
                best_score = score;
                best_index = i;
            }
        }

        Ok(MatchResult {
            score: best_score,
            accepted: best_score >= threshold,
            threshold,
            best_index,
        })
    }
}
