//! KeyFrame: a promoted frame and vertex of the covisibility graph.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::camera::PinholeCamera;
use crate::features::{Descriptor, KeyPoint};
use crate::geometry::SE3;
use crate::tracking::frame::Frame;

use super::types::{KeyFrameId, MapPointId};

/// A keyframe in the map.
///
/// Keyframes copy the promoted frame's observations and pose and add the
/// graph structure: covisibility edges weighted by shared map points, and
/// a spanning tree used for correction propagation.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Id of the frame this keyframe was promoted from.
    pub frame_id: u64,

    pub timestamp: Option<f64>,

    /// World-to-camera pose.
    pub pose: SE3,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Per-keypoint metric depth, `-1.0` when unknown (monocular).
    pub depth: Vec<f32>,

    /// Keypoint index -> associated map point.
    pub map_points: Vec<Option<MapPointId>>,

    pub camera: PinholeCamera,
    pub scale_factor: f64,
    pub n_levels: u32,

    /// Covisibility adjacency: neighbor -> shared map point count.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Neighbors ordered by descending weight; rebuilt lazily.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    /// Spanning tree.
    pub parent: Option<KeyFrameId>,
    pub children: HashSet<KeyFrameId>,

    pub is_bad: bool,

    /// Dedup marker for local-map assembly, keyed by frame id.
    pub track_reference_frame: u64,
}

impl KeyFrame {
    /// Promote a frame. The caller is responsible for registering the
    /// observations through [`Map::associate`](super::map::Map::associate).
    pub fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        Self {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pose: frame.pose().unwrap_or_else(SE3::identity),
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            depth: frame.depth.clone(),
            map_points: vec![None; frame.len()],
            camera: frame.camera,
            scale_factor: frame.scale_factor,
            n_levels: frame.n_levels,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            is_bad: false,
            track_reference_frame: 0,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.camera_center()
    }

    /// Camera-to-world transform.
    pub fn pose_inverse(&self) -> SE3 {
        self.pose.inverse()
    }

    // ── Map point slots ──────────────────────────────────────────────────

    pub fn map_point(&self, keypoint_idx: usize) -> Option<MapPointId> {
        self.map_points.get(keypoint_idx).copied().flatten()
    }

    pub fn set_map_point(&mut self, keypoint_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if keypoint_idx >= self.map_points.len() {
            return None;
        }
        self.map_points[keypoint_idx].replace(mp_id)
    }

    pub fn erase_map_point(&mut self, keypoint_idx: usize) -> Option<MapPointId> {
        self.map_points.get_mut(keypoint_idx).and_then(Option::take)
    }

    pub fn map_point_slots(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    // ── Covisibility graph ───────────────────────────────────────────────

    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisible_keyframes(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    /// The `n` neighbors sharing the most map points, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles.iter().take(n).map(|(id, _)| *id).collect()
    }

    fn ensure_ordered(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Stable tie-break on id so iteration order is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ── Spanning tree ────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent: KeyFrameId) {
        self.parent = Some(parent);
    }

    pub fn add_child(&mut self, child: KeyFrameId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyFrameId) {
        self.children.remove(&child);
    }

    // ── Spatial queries ──────────────────────────────────────────────────

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
}
