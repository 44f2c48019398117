//! Per-input frame representation.

use nalgebra::Vector3;

use crate::camera::PinholeCamera;
use crate::features::{Descriptor, DepthImage, Features, Image, KeyPoint};
use crate::geometry::SE3;
use crate::map::map_point::MapPoint;
use crate::map::types::{KeyFrameId, MapPointId};

/// Result of a frustum visibility test for one map point.
#[derive(Debug, Clone, Copy)]
pub struct FrustumHit {
    pub u: f64,
    pub v: f64,
    pub predicted_octave: i32,
    pub view_cos: f64,
}

/// A transient per-input observation.
///
/// Frames are created on every input and discarded after the next frame
/// arrives; only the previous frame is retained. Keypoint coordinates are
/// undistorted at construction. Map point references are arena handles
/// that must be resolved through the map while holding its lock.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub timestamp: Option<f64>,

    /// Source image, retained for the direct image aligner.
    pub image: Image,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Per-keypoint metric depth; `-1.0` when unavailable.
    pub depth: Vec<f32>,

    /// Keypoint index -> matched map point.
    pub map_points: Vec<Option<MapPointId>>,

    /// Per-keypoint outlier flag set by motion-only BA.
    pub outlier: Vec<bool>,

    pub reference_kf: Option<KeyFrameId>,

    pub camera: PinholeCamera,
    pub scale_factor: f64,
    pub n_levels: u32,

    pose: Option<SE3>,
}

impl Frame {
    /// Build a monocular frame from extractor output.
    pub fn monocular(id: u64, image: Image, features: Features, camera: PinholeCamera) -> Self {
        let n = features.len();
        let keypoints = undistort_keypoints(features.keypoints, &camera);
        Self {
            id,
            timestamp: None,
            image,
            keypoints,
            descriptors: features.descriptors,
            depth: vec![-1.0; n],
            map_points: vec![None; n],
            outlier: vec![false; n],
            reference_kf: None,
            camera,
            scale_factor: features.scale_factor,
            n_levels: features.n_levels,
            pose: None,
        }
    }

    /// Build an RGBD frame: per-keypoint depth is sampled at the raw
    /// keypoint location and scaled to meters before undistortion.
    pub fn rgbd(
        id: u64,
        image: Image,
        depth_image: &DepthImage,
        depth_scale: f32,
        features: Features,
        camera: PinholeCamera,
    ) -> Self {
        let depth: Vec<f32> = features
            .keypoints
            .iter()
            .map(|kp| {
                let u = kp.x.round().max(0.0) as u32;
                let v = kp.y.round().max(0.0) as u32;
                match depth_image.at(u, v) {
                    Some(raw) if raw > 0.0 => raw * depth_scale,
                    _ => -1.0,
                }
            })
            .collect();

        let n = features.len();
        let keypoints = undistort_keypoints(features.keypoints, &camera);
        Self {
            id,
            timestamp: None,
            image,
            keypoints,
            descriptors: features.descriptors,
            depth,
            map_points: vec![None; n],
            outlier: vec![false; n],
            reference_kf: None,
            camera,
            scale_factor: features.scale_factor,
            n_levels: features.n_levels,
            pose: None,
        }
    }

    /// Number of keypoints.
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = Some(pose);
    }

    pub fn clear_pose(&mut self) {
        self.pose = None;
    }

    pub fn pose(&self) -> Option<SE3> {
        self.pose
    }

    /// 4x4 pose matrix for the public API; zero when not tracking.
    pub fn pose_matrix(&self) -> nalgebra::Matrix4<f64> {
        match self.pose {
            Some(p) => p.to_matrix(),
            None => nalgebra::Matrix4::zeros(),
        }
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.map(|p| p.camera_center())
    }

    /// Keypoints with valid depth.
    pub fn valid_depth_count(&self) -> usize {
        self.depth.iter().filter(|&&z| z > 0.0).count()
    }

    /// Drop all map point matches and outlier flags.
    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|mp| *mp = None);
        self.outlier.iter_mut().for_each(|o| *o = false);
    }

    /// Back-project keypoint `i` into world coordinates using its measured
    /// depth and the current pose.
    pub fn unproject_to_world(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(i)? as f64;
        if z <= 0.0 {
            return None;
        }
        let kp = self.keypoints.get(i)?;
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.pose?.inverse().transform(&p_cam))
    }

    /// Keypoint indices within `radius` pixels of `(u, v)`, optionally
    /// restricted to a pyramid level range.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        let mut out = Vec::new();
        for (i, kp) in self.keypoints.iter().enumerate() {
            if min_level.is_some_and(|min| kp.octave < min) {
                continue;
            }
            if max_level.is_some_and(|max| kp.octave > max) {
                continue;
            }
            let du = kp.x as f64 - u;
            let dv = kp.y as f64 - v;
            if du * du + dv * dv <= radius_sq {
                out.push(i);
            }
        }
        out
    }

    /// Test a map point against this frame's frustum: in front of the
    /// camera, inside the image, within the point's scale-invariance
    /// distance bounds, and viewed within the angle cosine limit.
    pub fn check_frustum(&self, mp: &MapPoint, view_cos_limit: f64) -> Option<FrustumHit> {
        let pose = self.pose?;
        let p_cam = pose.transform(&mp.position);
        let (u, v) = self.camera.project(&p_cam)?;
        if !self.camera.is_in_image(u, v) {
            return None;
        }

        let center = pose.camera_center();
        let po = mp.position - center;
        let dist = po.norm();
        if !mp.is_in_distance_range(dist) {
            return None;
        }

        let view_cos = if mp.normal.norm() > 0.0 && dist > 1e-10 {
            po.dot(&mp.normal) / dist
        } else {
            1.0
        };
        if view_cos < view_cos_limit {
            return None;
        }

        Some(FrustumHit {
            u,
            v,
            predicted_octave: mp.predict_octave(dist, self.scale_factor, self.n_levels),
            view_cos,
        })
    }
}

fn undistort_keypoints(mut keypoints: Vec<KeyPoint>, camera: &PinholeCamera) -> Vec<KeyPoint> {
    if camera.has_distortion() {
        for kp in keypoints.iter_mut() {
            let (u, v) = camera.undistort_point(kp.x as f64, kp.y as f64);
            kp.x = u as f32;
            kp.y = v as f32;
        }
    }
    keypoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::types::MapPointId;

    fn test_camera() -> PinholeCamera {
        PinholeCamera {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    fn frame_with_keypoints(points: &[(f32, f32)]) -> Frame {
        let features = Features {
            keypoints: points.iter().map(|&(x, y)| KeyPoint::new(x, y)).collect(),
            descriptors: vec![Descriptor([0u8; 32]); points.len()],
            scale_factor: 2.0,
            n_levels: 5,
        };
        Frame::monocular(0, Image::black(640, 480), features, test_camera())
    }

    #[test]
    fn test_pose_matrix_zero_when_unset() {
        let frame = frame_with_keypoints(&[]);
        assert_eq!(frame.pose_matrix(), nalgebra::Matrix4::zeros());
    }

    #[test]
    fn test_rgbd_depth_sampling() {
        let mut depth_data = vec![0.0f32; 640 * 480];
        depth_data[100 * 640 + 50] = 5000.0;
        let depth_image = DepthImage::new(640, 480, depth_data);
        let features = Features {
            keypoints: vec![KeyPoint::new(50.0, 100.0), KeyPoint::new(10.0, 10.0)],
            descriptors: vec![Descriptor([0u8; 32]); 2],
            scale_factor: 2.0,
            n_levels: 5,
        };
        let frame = Frame::rgbd(
            0,
            Image::black(640, 480),
            &depth_image,
            1.0 / 5000.0,
            features,
            test_camera(),
        );
        assert!((frame.depth[0] - 1.0).abs() < 1e-6);
        assert_eq!(frame.depth[1], -1.0);
        assert_eq!(frame.valid_depth_count(), 1);
    }

    #[test]
    fn test_unproject_roundtrip() {
        let mut frame = frame_with_keypoints(&[(320.0, 240.0)]);
        frame.depth[0] = 2.0;
        frame.set_pose(SE3::identity());
        let p = frame.unproject_to_world(0).unwrap();
        assert!((p - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-9);
    }

    #[test]
    fn test_check_frustum() {
        let mut frame = frame_with_keypoints(&[(320.0, 240.0)]);
        frame.set_pose(SE3::identity());

        let mut mp = MapPoint::new(
            MapPointId(0),
            Vector3::new(0.0, 0.0, 2.0),
            Descriptor([0u8; 32]),
            crate::map::types::KeyFrameId(0),
        );
        mp.min_distance = 0.5;
        mp.max_distance = 10.0;
        mp.normal = Vector3::new(0.0, 0.0, 1.0);

        let hit = frame.check_frustum(&mp, 0.5).unwrap();
        assert!((hit.u - 320.0).abs() < 1e-9);
        assert!((hit.v - 240.0).abs() < 1e-9);
        assert!(hit.view_cos > 0.99);

        // Behind the camera.
        mp.position = Vector3::new(0.0, 0.0, -2.0);
        assert!(frame.check_frustum(&mp, 0.5).is_none());

        // Outside the distance bounds.
        mp.position = Vector3::new(0.0, 0.0, 50.0);
        assert!(frame.check_frustum(&mp, 0.5).is_none());
    }

    #[test]
    fn test_clear_matches() {
        let mut frame = frame_with_keypoints(&[(1.0, 1.0), (2.0, 2.0)]);
        frame.map_points[0] = Some(MapPointId(3));
        frame.outlier[1] = true;
        frame.clear_matches();
        assert!(frame.map_points.iter().all(Option::is_none));
        assert!(frame.outlier.iter().all(|o| !o));
    }
}
