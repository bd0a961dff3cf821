//! Probe frame selection and face cropping.
//!
//! The identity check runs on a single frame: the most frontal one seen with
//! the eyes open. A closed-eye frame is a poor embedding input, and so is a
//! turned head.

use crate::landmarks::{frontality, mean_eye_aspect_ratio, LandmarkLayout};
use crate::types::{FaceCrop, Frame, LandmarkSet};
use image::imageops;
use std::sync::Arc;

/// Frames less frontal than this are never used as the probe.
pub const DEFAULT_MIN_FRONTALITY: f32 = 0.7;

/// Extra context around the landmark bounds, as a fraction of the face size.
const CROP_MARGIN: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct ProbeCandidate {
    pub frame: Arc<Frame>,
    pub landmarks: LandmarkSet,
    pub quality: f32,
}

/// Keeps the best probe candidate seen so far.
#[derive(Debug)]
pub struct ProbeSelector {
    layout: LandmarkLayout,
    min_frontality: f32,
    min_open_ear: f32,
    best: Option<ProbeCandidate>,
}

impl ProbeSelector {
    /// `min_open_ear` is normally the liveness reopen threshold: the eyes must
    /// be unambiguously open.
    pub fn new(layout: LandmarkLayout, min_frontality: f32, min_open_ear: f32) -> Self {
        Self {
            layout,
            min_frontality,
            min_open_ear,
            best: None,
        }
    }

    /// Offer a frame. Returns true if it became the current best.
    pub fn consider(&mut self, frame: &Arc<Frame>, landmarks: &LandmarkSet) -> bool {
        let Some(ear) = mean_eye_aspect_ratio(landmarks, &self.layout) else {
            return false;
        };
        if ear <= self.min_open_ear {
            return false;
        }
        let Some(quality) = frontality(landmarks, &self.layout) else {
            return false;
        };
        if quality < self.min_frontality {
            return false;
        }
        if self.best.as_ref().is_some_and(|b| b.quality >= quality) {
            return false;
        }
        self.best = Some(ProbeCandidate {
            frame: Arc::clone(frame),
            landmarks: landmarks.clone(),
            quality,
        });
        true
    }

    pub fn has_probe(&self) -> bool {
        self.best.is_some()
    }

    pub fn best(&self) -> Option<&ProbeCandidate> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<ProbeCandidate> {
        self.best
    }
}

/// Square face region `(x, y, side, side)` clamped to the frame.
pub fn face_region(landmarks: &LandmarkSet, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let (x0, y0, x1, y1) = landmarks.bounds()?;
    let size = (x1 - x0).max(y1 - y0);
    if !(size > 0.0) {
        return None;
    }
    let side = size * (1.0 + 2.0 * CROP_MARGIN);
    let cx = (x0 + x1) / 2.0;
    let cy = (y0 + y1) / 2.0;

    let left = (cx - side / 2.0).max(0.0);
    let top = (cy - side / 2.0).max(0.0);
    let right = (cx + side / 2.0).min(width as f32);
    let bottom = (cy + side / 2.0).min(height as f32);
    if right <= left || bottom <= top {
        return None;
    }

    let w = (right - left) as u32;
    let h = (bottom - top) as u32;
    let side = w.min(h);
    if side == 0 {
        return None;
    }
    Some((left as u32, top as u32, side, side))
}

pub fn crop_face(candidate: &ProbeCandidate) -> Option<FaceCrop> {
    let frame = &candidate.frame;
    let (x, y, w, h) = face_region(&candidate.landmarks, frame.width(), frame.height())?;
    let image = imageops::crop_imm(&frame.image, x, y, w, h).to_image();
    Some(FaceCrop {
        image,
        source_sequence: frame.sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::FACE_MESH_LAYOUT;
    use crate::liveness::DEFAULT_REOPEN_THRESHOLD;
    use crate::test_support::{blank_frame, synthetic_face, turned_face};
    use crate::types::Point;

    fn selector() -> ProbeSelector {
        ProbeSelector::new(FACE_MESH_LAYOUT, DEFAULT_MIN_FRONTALITY, DEFAULT_REOPEN_THRESHOLD)
    }

    #[test]
    fn test_rejects_closed_eyes() {
        let mut s = selector();
        let frame = Arc::new(blank_frame(0, 0));
        assert!(!s.consider(&frame, &synthetic_face(0.10)));
        assert!(!s.consider(&frame, &synthetic_face(0.22)));
        assert!(!s.has_probe());
    }

    #[test]
    fn test_rejects_turned_head() {
        let mut s = selector();
        let frame = Arc::new(blank_frame(0, 0));
        assert!(!s.consider(&frame, &turned_face(0.30)));
        assert!(s.best().is_none());
    }

    #[test]
    fn test_keeps_most_frontal() {
        let mut s = selector();
        let mut slightly_turned = synthetic_face(0.30);
        slightly_turned.points[FACE_MESH_LAYOUT.nose_tip] = Point::new(160.0, 130.0);

        assert!(s.consider(&Arc::new(blank_frame(0, 0)), &slightly_turned));
        assert!(s.consider(&Arc::new(blank_frame(1, 33)), &synthetic_face(0.30)));
        // Equal quality does not replace the incumbent.
        assert!(!s.consider(&Arc::new(blank_frame(2, 66)), &synthetic_face(0.31)));

        let best = s.into_best().unwrap();
        assert_eq!(best.frame.sequence, 1);
        assert!((best.quality - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_face_region_includes_margin() {
        let face = synthetic_face(0.30);
        let (x, y, w, h) = face_region(&face, 256, 256).unwrap();
        assert_eq!(w, h);
        // Eye corners span x 100..200, so the crop must be wider than 100.
        assert!(w > 100);
        assert!(x < 100 && y < 95);
    }

    #[test]
    fn test_face_region_clamped_to_frame() {
        let set = LandmarkSet::new(vec![Point::new(0.0, 0.0), Point::new(60.0, 60.0)]);
        let (x, y, w, h) = face_region(&set, 64, 64).unwrap();
        assert_eq!((x, y), (0, 0));
        assert!(w <= 64 && h <= 64);
    }

    #[test]
    fn test_face_region_degenerate() {
        let set = LandmarkSet::new(vec![Point::new(5.0, 5.0)]);
        assert_eq!(face_region(&set, 64, 64), None);
        let outside = LandmarkSet::new(vec![Point::new(500.0, 500.0), Point::new(600.0, 600.0)]);
        assert_eq!(face_region(&outside, 64, 64), None);
    }

    #[test]
    fn test_crop_face() {
        let mut s = selector();
        s.consider(&Arc::new(blank_frame(4, 132)), &synthetic_face(0.3));
        let crop = crop_face(s.best().unwrap()).unwrap();
        assert_eq!(crop.source_sequence, 4);
        assert_eq!(crop.image.width(), crop.image.height());
        assert!(crop.image.width() > 0);
    }
}
