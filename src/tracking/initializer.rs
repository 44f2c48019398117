//! Bootstrap support: two-view geometry and fiducial pattern interfaces,
//! plus the state carried between the two monocular bootstrap stages.
//!
//! The geometric solvers themselves (homography/fundamental RANSAC and the
//! pattern detector) are external collaborators; the tracker owns the
//! orchestration: stage gating, seed-map creation, gauge fixing, resets.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;
use crate::tracking::frame::Frame;

/// Result of the external homography/fundamental decomposition.
pub struct TwoViewReconstruction {
    /// Rotation of the current view relative to the reference view.
    pub rotation: UnitQuaternion<f64>,
    /// Translation of the current view, arbitrary scale.
    pub translation: Vector3<f64>,
    /// Triangulated points in the reference camera frame, indexed by
    /// reference keypoint.
    pub points: Vec<Vector3<f64>>,
    /// Which reference keypoints triangulated in front of both cameras.
    pub triangulated: Vec<bool>,
}

/// External two-view bootstrap solver. Implementations are expected to run
/// enough RANSAC iterations (200 or more) before giving up.
pub trait TwoViewSolver: Send {
    fn reconstruct(
        &self,
        reference: &Frame,
        current: &Frame,
        matches: &[i32],
    ) -> Option<TwoViewReconstruction>;
}

/// A detected calibration pattern.
pub struct PatternDetection {
    /// Transform taking pattern-frame coordinates into the camera frame.
    pub camera_from_pattern: SE3,
    /// `(keypoint index, pattern-frame position)` for each detected corner.
    pub points: Vec<(usize, Vector3<f64>)>,
}

/// External fiducial detector used by the pattern bootstrap mode.
pub trait PatternDetector: Send {
    fn detect(&self, frame: &Frame) -> Option<PatternDetection>;
}

/// State between monocular bootstrap stages: the stored reference view and
/// the evolving match set against it.
pub struct MonoInitializer {
    pub reference: Frame,
    /// Last matched position per reference keypoint; seeds the windowed
    /// search in the next attempt.
    pub prev_matched: Vec<(f32, f32)>,
    /// Reference keypoint -> current keypoint matches (`-1` unmatched).
    pub matches: Vec<i32>,
}

impl MonoInitializer {
    pub fn new(reference: Frame) -> Self {
        let prev_matched = reference.keypoints.iter().map(|kp| (kp.x, kp.y)).collect();
        let n = reference.len();
        Self {
            reference,
            prev_matched,
            matches: vec![-1; n],
        }
    }
}
