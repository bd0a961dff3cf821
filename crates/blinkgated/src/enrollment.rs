//! Enrollment from a single still image.
//!
//! The image must show exactly one frontal face with open eyes; it goes
//! through the same landmark, probe-crop and embedding path as a check-in
//! probe so both sides of a comparison are produced alike.

use blinkgate_core::probe::{crop_face, ProbeSelector};
use blinkgate_core::{
    EmbeddingExtractor, FaceEmbedding, Frame, InferenceError, LandmarkDetection, LandmarkExtractor,
    LandmarkLayout,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::store::{BiometricStore, EnrollMode, StoreError};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no face detected in enrollment image")]
    NoFace,
    #[error("{0} faces in enrollment image, expected exactly one")]
    MultipleFaces(usize),
    #[error("face is turned away or eyes are closed; retake the photo")]
    PoorQuality,
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
    #[error("embedding model produced non-finite values")]
    NonFiniteEmbedding,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment worker failed: {0}")]
    Join(String),
}

/// Quality gate for enrollment images.
#[derive(Debug, Clone, Copy)]
pub struct EnrollPolicy {
    pub layout: LandmarkLayout,
    pub min_frontality: f32,
    pub min_open_ear: f32,
}

/// Reference embedding extracted from one image.
#[derive(Debug, Clone)]
pub struct ReferenceCapture {
    pub embedding: FaceEmbedding,
    pub quality: f32,
}

/// One enrollment request.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub user: String,
    pub image_path: PathBuf,
    pub label: String,
    pub mode: EnrollMode,
    pub required_blinks: u32,
}

/// Landmarks, quality gate, crop and embed. Blocking.
pub fn capture_reference(
    landmarks: &dyn LandmarkExtractor,
    embedder: &dyn EmbeddingExtractor,
    policy: &EnrollPolicy,
    image: image::RgbImage,
) -> Result<ReferenceCapture, EnrollError> {
    let frame = Arc::new(Frame::new(Duration::ZERO, 0, image));

    let set = match landmarks.extract(&frame)? {
        LandmarkDetection::Face(set) => set,
        LandmarkDetection::NoFace => return Err(EnrollError::NoFace),
        LandmarkDetection::MultipleFaces(n) => return Err(EnrollError::MultipleFaces(n)),
    };

    let mut selector = ProbeSelector::new(policy.layout, policy.min_frontality, policy.min_open_ear);
    if !selector.consider(&frame, &set) {
        return Err(EnrollError::PoorQuality);
    }
    let candidate = selector.into_best().ok_or(EnrollError::PoorQuality)?;
    let crop = crop_face(&candidate).ok_or(EnrollError::PoorQuality)?;

    let embedding = embedder.embed(&crop)?;
    if embedding.values.is_empty() || !embedding.is_finite() {
        return Err(EnrollError::NonFiniteEmbedding);
    }

    Ok(ReferenceCapture {
        embedding,
        quality: candidate.quality,
    })
}

/// Load the image, extract a reference and store it. Returns the new model id.
pub async fn enroll_from_image(
    landmarks: Arc<dyn LandmarkExtractor>,
    embedder: Arc<dyn EmbeddingExtractor>,
    store: &BiometricStore,
    policy: EnrollPolicy,
    request: EnrollRequest,
) -> Result<String, EnrollError> {
    let path = request.image_path.clone();
    let capture = tokio::task::spawn_blocking(move || {
        let image = load_image(&path)?;
        capture_reference(landmarks.as_ref(), embedder.as_ref(), &policy, image)
    })
    .await
    .map_err(|e| EnrollError::Join(e.to_string()))??;

    let id = store
        .enroll(
            &request.user,
            &request.label,
            &capture.embedding,
            capture.quality,
            request.required_blinks,
            request.mode,
        )
        .await?;

    tracing::info!(
        user = %request.user,
        label = %request.label,
        id = %id,
        quality = capture.quality,
        model_version = %capture.embedding.model_version,
        mode = ?request.mode,
        "enrolled reference"
    );
    Ok(id)
}

fn load_image(path: &Path) -> Result<image::RgbImage, EnrollError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| EnrollError::Image {
            path: path.to_path_buf(),
            source,
        })
}
