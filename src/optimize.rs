//! Nonlinear optimization interface.
//!
//! Motion-only BA and global BA are external collaborators. The contract
//! is small: motion-only BA refines the frame pose in place, flags outlier
//! associations, and reports the surviving inlier count.

use crate::map::map::Map;
use crate::tracking::frame::Frame;

pub trait PoseOptimizer: Send {
    /// Motion-only bundle adjustment: refine `frame`'s pose against its
    /// currently matched map points, set the per-keypoint outlier flags,
    /// and return the number of inliers.
    fn pose_optimization(&self, frame: &mut Frame, map: &Map) -> usize;

    /// Full-map bundle adjustment, used once after monocular bootstrap.
    fn global_ba(&self, map: &mut Map, iterations: usize);
}

/// Reprojection-gated stand-in for a real solver: keeps the seed pose,
/// classifies matches by reprojection error, and counts the survivors.
/// Deterministic, which also makes it the reference optimizer for tests.
pub struct ReprojectionGate {
    /// Outlier threshold in pixels.
    pub max_error_px: f64,
}

impl Default for ReprojectionGate {
    fn default() -> Self {
        Self { max_error_px: 5.99 }
    }
}

impl PoseOptimizer for ReprojectionGate {
    fn pose_optimization(&self, frame: &mut Frame, map: &Map) -> usize {
        let Some(pose) = frame.pose() else {
            return 0;
        };
        let mut inliers = 0usize;
        for i in 0..frame.len() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            let Some(mp) = map.map_point(mp_id) else {
                frame.outlier[i] = true;
                continue;
            };
            let p_cam = pose.transform(&mp.position);
            let err = match frame.camera.project(&p_cam) {
                Some((u, v)) => {
                    let kp = &frame.keypoints[i];
                    ((kp.x as f64 - u).powi(2) + (kp.y as f64 - v).powi(2)).sqrt()
                }
                None => f64::INFINITY,
            };
            if err > self.max_error_px {
                frame.outlier[i] = true;
            } else {
                frame.outlier[i] = false;
                inliers += 1;
            }
        }
        inliers
    }

    fn global_ba(&self, _map: &mut Map, _iterations: usize) {}
}
