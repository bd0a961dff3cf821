//! Eye geometry over facial landmark sets.
//!
//! The eye aspect ratio (EAR) compares the vertical lid opening to the
//! horizontal eye width using six points per eye:
//!
//! ```text
//! EAR = (|upper1 - lower1| + |upper2 - lower2|) / (2 * |corner1 - corner2|)
//! ```
//!
//! An open eye sits around 0.25–0.35 and drops towards zero as the lids meet.
//! The ratio is scale invariant, so it does not depend on how far the subject
//! stands from the camera.

use crate::types::{LandmarkSet, Point};

/// Eye widths below this (in pixels) are treated as degenerate geometry.
const MIN_EYE_WIDTH: f32 = 1e-3;

/// Landmark indices of the six EAR points for one eye.
///
/// `upper[i]` is paired with `lower[i]` for the vertical distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeIndices {
    /// Corner farthest from the nose.
    pub outer_corner: usize,
    pub inner_corner: usize,
    pub upper: [usize; 2],
    pub lower: [usize; 2],
}

impl EyeIndices {
    /// Resolve the six points in fixed order:
    /// `[outer, inner, upper1, upper2, lower1, lower2]`.
    pub fn points(&self, set: &LandmarkSet) -> Option<[Point; 6]> {
        Some([
            set.get(self.outer_corner)?,
            set.get(self.inner_corner)?,
            set.get(self.upper[0])?,
            set.get(self.upper[1])?,
            set.get(self.lower[0])?,
            set.get(self.lower[1])?,
        ])
    }
}

/// Semantic indices into a landmark set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkLayout {
    pub left_eye: EyeIndices,
    pub right_eye: EyeIndices,
    pub nose_tip: usize,
    /// Number of points a set produced by this model carries.
    pub point_count: usize,
}

/// 468-point face mesh topology.
pub const FACE_MESH_LAYOUT: LandmarkLayout = LandmarkLayout {
    left_eye: EyeIndices {
        outer_corner: 33,
        inner_corner: 133,
        upper: [160, 158],
        lower: [144, 153],
    },
    right_eye: EyeIndices {
        outer_corner: 263,
        inner_corner: 362,
        upper: [385, 387],
        lower: [380, 373],
    },
    nose_tip: 1,
    point_count: 468,
};

impl LandmarkLayout {
    /// Whether `set` was produced by a model with this topology.
    pub fn fits(&self, set: &LandmarkSet) -> bool {
        set.len() == self.point_count
    }
}

impl Default for LandmarkLayout {
    fn default() -> Self {
        FACE_MESH_LAYOUT
    }
}

/// EAR from six points in `[corner1, corner2, upper1, upper2, lower1, lower2]` order.
///
/// Returns `None` when the corners coincide.
pub fn ear_from_points(p: &[Point; 6]) -> Option<f32> {
    let width = p[0].distance(&p[1]);
    if !(width >= MIN_EYE_WIDTH) {
        return None;
    }
    let v1 = p[2].distance(&p[4]);
    let v2 = p[3].distance(&p[5]);
    Some((v1 + v2) / (2.0 * width))
}

pub fn eye_aspect_ratio(set: &LandmarkSet, eye: &EyeIndices) -> Option<f32> {
    ear_from_points(&eye.points(set)?)
}

/// Mean EAR of both eyes, or `None` if the set does not fit the layout or
/// either eye cannot be measured.
pub fn mean_eye_aspect_ratio(set: &LandmarkSet, layout: &LandmarkLayout) -> Option<f32> {
    if !layout.fits(set) {
        return None;
    }
    let left = eye_aspect_ratio(set, &layout.left_eye)?;
    let right = eye_aspect_ratio(set, &layout.right_eye)?;
    let mean = (left + right) / 2.0;
    mean.is_finite().then_some(mean)
}

/// Head-yaw proxy in [0, 1]: 1.0 when the nose tip is equidistant from both
/// outer eye corners, falling towards 0 as the head turns.
pub fn frontality(set: &LandmarkSet, layout: &LandmarkLayout) -> Option<f32> {
    if !layout.fits(set) {
        return None;
    }
    let nose = set.get(layout.nose_tip)?;
    let left = set.get(layout.left_eye.outer_corner)?;
    let right = set.get(layout.right_eye.outer_corner)?;

    let dl = nose.distance(&left);
    let dr = nose.distance(&right);
    let longer = dl.max(dr);
    if !(longer >= MIN_EYE_WIDTH) {
        return None;
    }
    Some(dl.min(dr) / longer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{synthetic_face, turned_face};

    fn eye(outer: (f32, f32), inner: (f32, f32), half_open: f32) -> [Point; 6] {
        let x1 = outer.0 + (inner.0 - outer.0) / 3.0;
        let x2 = outer.0 + 2.0 * (inner.0 - outer.0) / 3.0;
        let y = outer.1;
        [
            Point::new(outer.0, outer.1),
            Point::new(inner.0, inner.1),
            Point::new(x1, y - half_open),
            Point::new(x2, y - half_open),
            Point::new(x1, y + half_open),
            Point::new(x2, y + half_open),
        ]
    }

    #[test]
    fn test_ear_known_geometry() {
        // width 30, each vertical gap 6 → (6 + 6) / 60 = 0.2
        let points = eye((0.0, 0.0), (30.0, 0.0), 3.0);
        let ear = ear_from_points(&points).unwrap();
        assert!((ear - 0.2).abs() < 1e-6, "got {ear}");
    }

    #[test]
    fn test_ear_closed_eye_is_zero() {
        let points = eye((0.0, 0.0), (30.0, 0.0), 0.0);
        assert_eq!(ear_from_points(&points), Some(0.0));
    }

    #[test]
    fn test_ear_degenerate_width() {
        let points = eye((5.0, 5.0), (5.0, 5.0), 2.0);
        assert_eq!(ear_from_points(&points), None);
    }

    #[test]
    fn test_ear_scale_invariant() {
        let small = ear_from_points(&eye((0.0, 0.0), (30.0, 0.0), 4.0)).unwrap();
        let large = ear_from_points(&eye((0.0, 0.0), (300.0, 0.0), 40.0)).unwrap();
        assert!((small - large).abs() < 1e-5);
    }

    #[test]
    fn test_mean_ear_on_face_mesh() {
        let face = synthetic_face(0.31);
        let ear = mean_eye_aspect_ratio(&face, &FACE_MESH_LAYOUT).unwrap();
        assert!((ear - 0.31).abs() < 1e-4, "got {ear}");
    }

    #[test]
    fn test_mean_ear_missing_points() {
        let partial = LandmarkSet::new(vec![Point::new(1.0, 1.0); 100]);
        assert_eq!(mean_eye_aspect_ratio(&partial, &FACE_MESH_LAYOUT), None);
    }

    #[test]
    fn test_set_with_wrong_point_count_rejected() {
        // Every index the layout uses is present, but the set is not a 468-point mesh.
        let mut points = synthetic_face(0.31).points;
        points.extend(std::iter::repeat(Point::new(0.0, 0.0)).take(10));
        let oversized = LandmarkSet::new(points);
        assert!(!FACE_MESH_LAYOUT.fits(&oversized));
        assert_eq!(mean_eye_aspect_ratio(&oversized, &FACE_MESH_LAYOUT), None);
        assert_eq!(frontality(&oversized, &FACE_MESH_LAYOUT), None);
        assert!(FACE_MESH_LAYOUT.fits(&synthetic_face(0.31)));
    }

    #[test]
    fn test_frontality_symmetric_face() {
        let f = frontality(&synthetic_face(0.3), &FACE_MESH_LAYOUT).unwrap();
        assert!((f - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_frontality_turned_face() {
        let f = frontality(&turned_face(0.3), &FACE_MESH_LAYOUT).unwrap();
        assert!(f < 0.7, "got {f}");
    }
}
