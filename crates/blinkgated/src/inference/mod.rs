//! ONNX Runtime backends for the check-in pipeline.
//!
//! All three sessions are loaded once at startup. Pinned models are checked
//! against the manifest before loading; the embedding model's digest becomes
//! the version tag stamped on every embedding.

pub mod detector;
pub mod embedder;
pub mod mesh;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use detector::{FaceBox, FaceDetector};
pub use embedder::OnnxEmbedder;
pub use mesh::FaceMeshLandmarker;

use blinkgate_core::InferenceError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("model integrity: {0}")]
    Integrity(#[from] blinkgate_models::ModelIntegrityError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    Shape(String),
    #[error("inference session lock poisoned")]
    Poisoned,
}

impl From<RuntimeError> for InferenceError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Poisoned | RuntimeError::Integrity(_) => {
                InferenceError::Unavailable(e.to_string())
            }
            RuntimeError::Ort(_) | RuntimeError::Shape(_) => InferenceError::Failed(e.to_string()),
        }
    }
}

/// Loaded landmark (detector-gated) and embedding sessions.
pub struct InferenceRuntime {
    pub landmarks: Arc<FaceMeshLandmarker>,
    pub embedder: Arc<OnnxEmbedder>,
}

impl InferenceRuntime {
    /// Verify and load all three models. Fails fast if any is missing,
    /// tampered with, or rejected by ONNX Runtime.
    pub fn load(
        detector_path: &Path,
        landmark_path: &Path,
        embedding_path: &Path,
    ) -> Result<Self, RuntimeError> {
        verify(detector_path)?;
        verify(landmark_path)?;
        let embedding_digest = verify(embedding_path)?;
        let version = blinkgate_models::model_version_tag(embedding_path, &embedding_digest);

        let detector = Arc::new(FaceDetector::load(detector_path)?);
        let landmarks = Arc::new(FaceMeshLandmarker::load(landmark_path, detector.clone())?);
        let embedder = Arc::new(OnnxEmbedder::load(embedding_path, version)?);

        tracing::info!(
            embedding_version = embedder.version(),
            "inference runtime ready"
        );

        Ok(Self {
            landmarks,
            embedder,
        })
    }

    pub fn embedding_version(&self) -> &str {
        self.embedder.version()
    }
}

fn verify(path: &Path) -> Result<String, RuntimeError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let digest = blinkgate_models::verify_known_model(&name, path)?;
    tracing::debug!(model = %name, sha256 = %digest, "model verified");
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_fails_fast() {
        let dir = std::env::temp_dir().join(format!("blinkgate-runtime-{}", uuid::Uuid::new_v4()));
        let err = InferenceRuntime::load(
            &dir.join("det_10g.onnx"),
            &dir.join("face_landmark.onnx"),
            &dir.join("w600k_r50.onnx"),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            RuntimeError::Integrity(blinkgate_models::ModelIntegrityError::MissingModel { .. })
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            InferenceError::from(RuntimeError::Poisoned),
            InferenceError::Unavailable(_)
        ));
        assert!(matches!(
            InferenceError::from(RuntimeError::Shape("short".into())),
            InferenceError::Failed(_)
        ));
    }
}
