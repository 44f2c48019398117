//! MapPoint: a 3D landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D landmark.
///
/// Observations are symmetric with keyframe slots: `(kf, i)` is in
/// `observations` exactly when `kf.map_points[i]` holds this point. The
/// `track_*` fields are per-frame matching scratch written during the
/// frustum test and consumed by the projection matcher in the same `track()`
/// call; they are only meaningful while the map lock is held.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Representative descriptor, cloned from the best observation.
    pub descriptor: Descriptor,

    /// Observing keyframe -> keypoint index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point fell inside a frame's frustum.
    pub visible_count: u32,
    /// Times the point was actually matched in a frame.
    pub found_count: u32,

    /// Keyframe that created this point.
    pub reference_kf: KeyFrameId,

    /// Set when this point has been fused into another; readers chase the
    /// handle once and drop the stale one.
    pub replaced_by: Option<MapPointId>,

    pub is_bad: bool,

    // Per-frame tracking scratch.
    pub last_frame_seen: u64,
    pub track_reference_frame: u64,
    pub track_in_view: bool,
    pub track_proj_x: f64,
    pub track_proj_y: f64,
    pub track_octave: i32,
    pub track_view_cos: f64,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 0,
            found_count: 0,
            reference_kf,
            replaced_by: None,
            is_bad: false,
            last_frame_seen: 0,
            track_reference_frame: 0,
            track_in_view: false,
            track_proj_x: 0.0,
            track_proj_y: 0.0,
            track_octave: 0,
            track_view_cos: 0.0,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, keypoint_idx: usize) {
        self.observations.insert(kf_id, keypoint_idx);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self) {
        self.visible_count += 1;
    }

    pub fn increase_found(&mut self) {
        self.found_count += 1;
    }

    /// found / visible, defaulting to 1.0 for points never tested.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Predict the pyramid level a keypoint observing this point from
    /// `distance` away would land on.
    pub fn predict_octave(&self, distance: f64, scale_factor: f64, n_levels: u32) -> i32 {
        if distance <= 0.0 || self.max_distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale_factor.ln()).ceil() as i32;
        level.clamp(0, n_levels as i32 - 1)
    }

    /// Recompute the mean viewing direction and distance bounds from the
    /// observing camera centers.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        reference_center: Option<&Vector3<f64>>,
        scale_factor: f64,
        n_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut count = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                count += 1;
            }
        }
        if count > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        // Distance bounds come from the reference keyframe, scaled by the
        // pyramid range.
        if let Some(center) = reference_center {
            let dist = (self.position - center).norm();
            let scale_range = scale_factor.powi(n_levels as i32 - 1);
            if dist > 1e-10 {
                self.max_distance = dist * scale_range;
                self.min_distance = self.max_distance / scale_range / scale_range;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> MapPoint {
        MapPoint::new(
            MapPointId(7),
            Vector3::new(0.0, 0.0, 2.0),
            Descriptor([0u8; 32]),
            KeyFrameId(0),
        )
    }

    #[test]
    fn test_observation_bookkeeping() {
        let mut mp = point();
        mp.add_observation(KeyFrameId(1), 4);
        mp.add_observation(KeyFrameId(2), 9);
        assert_eq!(mp.num_observations(), 2);
        assert!(mp.erase_observation(KeyFrameId(1)));
        assert!(!mp.erase_observation(KeyFrameId(1)));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_found_ratio_defaults_to_one() {
        let mut mp = point();
        assert_eq!(mp.found_ratio(), 1.0);
        mp.visible_count = 4;
        mp.found_count = 1;
        assert!((mp.found_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_normal_and_depth() {
        let mut mp = point();
        mp.add_observation(KeyFrameId(0), 0);
        let centers = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.2, 0.0, 0.0)];
        mp.update_normal_and_depth(centers.iter(), Some(&centers[0]), 2.0, 5);
        assert!(mp.normal.norm() > 0.99);
        assert!(mp.max_distance > mp.min_distance);
        assert!(mp.is_in_distance_range(2.0));
    }

    #[test]
    fn test_predict_octave_clamps() {
        let mut mp = point();
        mp.max_distance = 8.0;
        assert_eq!(mp.predict_octave(8.0, 2.0, 5), 0);
        assert_eq!(mp.predict_octave(4.0, 2.0, 5), 1);
        assert_eq!(mp.predict_octave(0.01, 2.0, 5), 4);
    }
}
