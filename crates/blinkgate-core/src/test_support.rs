//! Synthetic face-mesh landmarks for unit tests.

use crate::landmarks::{EyeIndices, FACE_MESH_LAYOUT};
use crate::types::{Frame, LandmarkSet, Point};
use image::RgbImage;
use std::time::Duration;

const EYE_WIDTH: f32 = 30.0;
const EYE_Y: f32 = 100.0;

fn place_eye(points: &mut [Point], eye: &EyeIndices, outer_x: f32, inner_x: f32, ear: f32) {
    // EAR = 4h / (2w) with both vertical gaps equal to 2h.
    let half = ear * EYE_WIDTH / 2.0;
    let x1 = outer_x + (inner_x - outer_x) / 3.0;
    let x2 = outer_x + 2.0 * (inner_x - outer_x) / 3.0;
    points[eye.outer_corner] = Point::new(outer_x, EYE_Y);
    points[eye.inner_corner] = Point::new(inner_x, EYE_Y);
    points[eye.upper[0]] = Point::new(x1, EYE_Y - half);
    points[eye.upper[1]] = Point::new(x2, EYE_Y - half);
    points[eye.lower[0]] = Point::new(x1, EYE_Y + half);
    points[eye.lower[1]] = Point::new(x2, EYE_Y + half);
}

fn face_with_nose(ear: f32, nose: Point) -> LandmarkSet {
    let layout = FACE_MESH_LAYOUT;
    // Unused mesh points sit on the face centre so the crop bounds stay tight.
    let mut points = vec![Point::new(150.0, 120.0); layout.point_count];
    place_eye(&mut points, &layout.left_eye, 100.0, 100.0 + EYE_WIDTH, ear);
    place_eye(&mut points, &layout.right_eye, 200.0, 200.0 - EYE_WIDTH, ear);
    points[layout.nose_tip] = nose;
    LandmarkSet::new(points)
}

/// Frontal face whose mean EAR equals `ear`.
pub fn synthetic_face(ear: f32) -> LandmarkSet {
    face_with_nose(ear, Point::new(150.0, 130.0))
}

/// Same eyes, nose pushed towards the right eye (head turned).
pub fn turned_face(ear: f32) -> LandmarkSet {
    face_with_nose(ear, Point::new(192.0, 130.0))
}

pub fn blank_frame(sequence: u32, millis: u64) -> Frame {
    Frame::new(
        Duration::from_millis(millis),
        sequence,
        RgbImage::new(256, 256),
    )
}
