//! 468-point face mesh landmarks.
//!
//! The SCRFD detector gates each frame (no face, several faces, or one), then
//! the mesh model runs on a square crop around the single face. Mesh output is
//! in crop pixels and is mapped back to frame coordinates.

use blinkgate_core::{
    Frame, InferenceError, LandmarkDetection, LandmarkExtractor, LandmarkSet, Point,
    FACE_MESH_LAYOUT,
};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{FaceDetector, FaceBox, RuntimeError};

const MESH_INPUT_SIZE: u32 = 192;
/// Crop side relative to the longer detector box edge.
const MESH_CROP_SCALE: f32 = 1.5;
const MESH_VALUES_PER_POINT: usize = 3;

/// Region of the frame fed to the mesh model.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropRegion {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

pub struct FaceMeshLandmarker {
    detector: Arc<FaceDetector>,
    session: Mutex<Session>,
    /// Whether the model exports a face-presence logit as its second output.
    has_presence: bool,
}

impl FaceMeshLandmarker {
    pub fn load(model_path: &Path, detector: Arc<FaceDetector>) -> Result<Self, RuntimeError> {
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        tracing::info!(path = %model_path.display(), ?outputs, "loaded face mesh model");

        Ok(Self {
            detector,
            has_presence: outputs.len() > 1,
            session: Mutex::new(session),
        })
    }

    fn run_mesh(&self, frame: &Frame, face: &FaceBox) -> Result<LandmarkDetection, RuntimeError> {
        let Some(region) = crop_region(face, frame.width(), frame.height()) else {
            return Ok(LandmarkDetection::NoFace);
        };
        let crop = imageops::crop_imm(&frame.image, region.x, region.y, region.width, region.height)
            .to_image();
        let input = mesh_input(&crop);

        let mut session = self.session.lock().map_err(|_| RuntimeError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        if self.has_presence {
            let (_, logit) = outputs[1].try_extract_tensor::<f32>()?;
            if !logit.first().copied().is_some_and(face_present) {
                return Ok(LandmarkDetection::NoFace);
            }
        }

        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
        let set = decode_mesh(raw, &region).ok_or_else(|| {
            RuntimeError::Shape(format!(
                "expected {} mesh values, got {}",
                FACE_MESH_LAYOUT.point_count * MESH_VALUES_PER_POINT,
                raw.len()
            ))
        })?;
        Ok(LandmarkDetection::Face(set))
    }
}

impl LandmarkExtractor for FaceMeshLandmarker {
    fn extract(&self, frame: &Frame) -> Result<LandmarkDetection, InferenceError> {
        let faces = self.detector.detect(&frame.image)?;
        match faces.as_slice() {
            [] => Ok(LandmarkDetection::NoFace),
            [face] => Ok(self.run_mesh(frame, face)?),
            many => {
                tracing::debug!(sequence = frame.sequence, faces = many.len(), "multiple faces");
                Ok(LandmarkDetection::MultipleFaces(many.len()))
            }
        }
    }
}

/// Square region around a detector box, clamped to the frame.
fn crop_region(face: &FaceBox, frame_w: u32, frame_h: u32) -> Option<CropRegion> {
    let side = face.width.max(face.height) * MESH_CROP_SCALE;
    if !(side.is_finite() && side >= 1.0) {
        return None;
    }
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    if !(cx.is_finite() && cy.is_finite()) {
        return None;
    }

    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let x1 = (cx + side / 2.0).min(frame_w as f32);
    let y1 = (cy + side / 2.0).min(frame_h as f32);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }

    Some(CropRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// NHWC tensor in [0, 1].
fn mesh_input(crop: &RgbImage) -> Array4<f32> {
    let size = MESH_INPUT_SIZE as usize;
    let resized = imageops::resize(crop, MESH_INPUT_SIZE, MESH_INPUT_SIZE, imageops::FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Map raw mesh output (x, y, z per point, in model input pixels) back to
/// frame coordinates.
fn decode_mesh(raw: &[f32], region: &CropRegion) -> Option<LandmarkSet> {
    let needed = FACE_MESH_LAYOUT.point_count * MESH_VALUES_PER_POINT;
    if raw.len() < needed {
        return None;
    }
    let sx = region.width as f32 / MESH_INPUT_SIZE as f32;
    let sy = region.height as f32 / MESH_INPUT_SIZE as f32;

    let points = raw[..needed]
        .chunks_exact(MESH_VALUES_PER_POINT)
        .map(|p| Point {
            x: region.x as f32 + p[0] * sx,
            y: region.y as f32 + p[1] * sy,
            z: p[2] * sx,
        })
        .collect();
    Some(LandmarkSet::new(points))
}

fn face_present(logit: f32) -> bool {
    1.0 / (1.0 + (-logit).exp()) > 0.5
}
