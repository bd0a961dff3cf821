//! ArcFace embedding extraction via ONNX Runtime.

use blinkgate_core::{EmbeddingExtractor, FaceCrop, FaceEmbedding, InferenceError};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

use super::RuntimeError;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0

pub struct OnnxEmbedder {
    session: Mutex<Session>,
    version: String,
}

impl OnnxEmbedder {
    /// `version` is stamped on every embedding; see `model_version_tag`.
    pub fn load(model_path: &Path, version: String) -> Result<Self, RuntimeError> {
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            version = %version,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn run(&self, crop: &RgbImage) -> Result<Vec<f32>, RuntimeError> {
        let input = preprocess(crop);
        let mut session = self.session.lock().map_err(|_| RuntimeError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
        if raw.is_empty() {
            return Err(RuntimeError::Shape("empty embedding".to_string()));
        }
        Ok(l2_normalize(raw.to_vec()))
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    fn embed(&self, face: &FaceCrop) -> Result<FaceEmbedding, InferenceError> {
        let values = self.run(&face.image)?;
        Ok(FaceEmbedding::new(values, self.version.clone()))
    }

    fn model_version(&self) -> &str {
        &self.version
    }
}

/// Resize a face crop to 112x112 and normalize into an NCHW tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = imageops::resize(
        crop,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        imageops::FilterType::Triangle,
    );
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_channels() {
        let crop = RgbImage::from_pixel(80, 96, image::Rgb([255, 0, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 50, 50]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 50, 50]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 50, 50]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
