//! The shared map: keyframe and map point arenas plus their relations.
//!
//! The map owns every keyframe and map point. All cross-references are
//! arena handles resolved through fallible lookups; chasing a handle
//! requires holding the map's mutation lock (the tracker wraps the whole
//! `track()` call in it, the local mapper locks around each structural
//! mutation).

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;
use crate::geometry::SE3;
use crate::tracking::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Container for the sparse 3D map.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// Keyframe ids in insertion order; relocalization scans this in
    /// reverse.
    keyframe_order: Vec<KeyFrameId>,

    /// First keyframes after each (re)initialization.
    origins: Vec<KeyFrameId>,

    /// Local map points published for the viewer.
    reference_map_points: Vec<MapPointId>,

    next_kf_id: u64,
    next_mp_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            keyframe_order: Vec::new(),
            origins: Vec::new(),
            reference_map_points: Vec::new(),
            next_kf_id: 0,
            next_mp_id: 0,
        }
    }

    // ── KeyFrames ────────────────────────────────────────────────────────

    /// Promote a frame to a keyframe and register it.
    pub fn insert_keyframe_from_frame(&mut self, frame: &Frame) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::from_frame(id, frame);
        self.keyframes.insert(id, kf);
        self.keyframe_order.push(id);
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes.len()
    }

    /// All keyframe ids in insertion order.
    pub fn all_keyframes(&self) -> &[KeyFrameId] {
        &self.keyframe_order
    }

    pub fn add_origin(&mut self, id: KeyFrameId) {
        self.origins.push(id);
    }

    pub fn origins(&self) -> &[KeyFrameId] {
        &self.origins
    }

    // ── MapPoints ────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, reference_kf));
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points_in_map(&self) -> usize {
        self.map_points.values().filter(|mp| !mp.is_bad).count()
    }

    pub fn all_map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn set_reference_map_points(&mut self, ids: Vec<MapPointId>) {
        self.reference_map_points = ids;
    }

    pub fn reference_map_points(&self) -> &[MapPointId] {
        &self.reference_map_points
    }

    /// Chase a handle to its live map point: follows `replaced_by` once and
    /// drops bad points. Returns `None` when nothing usable remains.
    pub fn resolve(&self, id: MapPointId) -> Option<MapPointId> {
        let mp = self.map_points.get(&id)?;
        if let Some(rep) = mp.replaced_by {
            let rep_mp = self.map_points.get(&rep)?;
            if rep_mp.is_bad {
                return None;
            }
            return Some(rep);
        }
        if mp.is_bad {
            return None;
        }
        Some(id)
    }

    // ── Associations ─────────────────────────────────────────────────────

    /// Create the bidirectional association between a keyframe slot and a
    /// map point, updating covisibility with every other observer.
    pub fn associate(&mut self, kf_id: KeyFrameId, keypoint_idx: usize, mp_id: MapPointId) -> bool {
        let existing: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.keys().copied().collect(),
            None => return false,
        };
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }

        self.map_points
            .get_mut(&mp_id)
            .expect("checked above")
            .add_observation(kf_id, keypoint_idx);
        self.keyframes
            .get_mut(&kf_id)
            .expect("checked above")
            .set_map_point(keypoint_idx, mp_id);

        for other in existing {
            if other == kf_id {
                continue;
            }
            let weight = self
                .keyframes
                .get(&other)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other, weight);
            }
            if let Some(kf) = self.keyframes.get_mut(&other) {
                kf.set_covisibility(kf_id, weight);
            }
        }
        true
    }

    /// Remove the association held by a keyframe slot. Returns the map
    /// point that was detached.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, keypoint_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.map_point(keypoint_idx)?;

        let others: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.keys().filter(|&&k| k != kf_id).copied().collect())
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(keypoint_idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        for other in others {
            let weight = self
                .keyframes
                .get(&other)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0);
            if weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other);
                }
                if let Some(kf) = self.keyframes.get_mut(&other) {
                    kf.erase_covisibility(kf_id);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_covisibility(other, weight - 1);
                }
                if let Some(kf) = self.keyframes.get_mut(&other) {
                    kf.set_covisibility(kf_id, weight - 1);
                }
            }
        }
        Some(mp_id)
    }

    /// Fuse `old` into `new`: every observation of `old` moves to `new`
    /// (unless the keyframe already observes `new`), counters accumulate,
    /// and `old` keeps a forwarding handle for readers holding stale ids.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&old) {
            Some(mp) => mp.observations.iter().map(|(&k, &i)| (k, i)).collect(),
            None => return,
        };

        for (kf_id, idx) in observations {
            let already = self
                .map_points
                .get(&new)
                .map(|mp| mp.observations.contains_key(&kf_id))
                .unwrap_or(false);
            self.disassociate(kf_id, idx);
            if !already {
                self.associate(kf_id, idx, new);
            }
        }

        let (visible, found) = self
            .map_points
            .get(&old)
            .map(|mp| (mp.visible_count, mp.found_count))
            .unwrap_or((0, 0));
        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.visible_count += visible;
            mp.found_count += found;
        }
        if let Some(mp) = self.map_points.get_mut(&old) {
            mp.replaced_by = Some(new);
            mp.is_bad = true;
        }
    }

    /// Mark a map point bad and detach it from every observing keyframe.
    /// The arena entry stays behind so stale handles keep failing softly.
    pub fn set_bad_map_point(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.iter().map(|(&k, &i)| (k, i)).collect(),
            None => return,
        };
        for (kf_id, idx) in observations {
            self.disassociate(kf_id, idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.set_bad();
        }
    }

    // ── Derived geometry ─────────────────────────────────────────────────

    /// Recompute a point's viewing normal and distance bounds from its
    /// current observations.
    pub fn update_point_geometry(&mut self, mp_id: MapPointId) {
        let (centers, reference) = match self.map_points.get(&mp_id) {
            Some(mp) => {
                let centers: Vec<Vector3<f64>> = mp
                    .observations
                    .keys()
                    .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
                    .collect();
                let reference = self
                    .keyframes
                    .get(&mp.reference_kf)
                    .map(|kf| kf.camera_center());
                (centers, reference)
            }
            None => return,
        };
        let (scale_factor, n_levels) = self
            .keyframes
            .values()
            .next()
            .map(|kf| (kf.scale_factor, kf.n_levels))
            .unwrap_or((2.0, 5));
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.iter(), reference.as_ref(), scale_factor, n_levels);
        }
    }

    /// Pick the descriptor with the smallest median distance to the other
    /// observations as the point's representative descriptor.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(kf_id, &idx)| {
                    self.keyframes
                        .get(kf_id)
                        .and_then(|kf| kf.descriptors.get(idx))
                        .copied()
                })
                .collect(),
            None => return,
        };
        if descriptors.len() < 2 {
            return;
        }

        let mut best = (u32::MAX, 0usize);
        for (i, d) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors.iter().map(|o| d.distance(o)).collect();
            dists.sort_unstable();
            let median = dists[dists.len() / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best.1];
        }
    }

    /// Pose of a keyframe, if it still exists.
    pub fn keyframe_pose(&self, id: KeyFrameId) -> Option<SE3> {
        self.keyframes.get(&id).map(|kf| kf.pose)
    }

    /// Number of map points in a keyframe observed by at least `min_obs`
    /// keyframes.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.map_point_slots()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .is_some_and(|mp| !mp.is_bad && mp.num_observations() >= min_obs)
            })
            .count()
    }

    /// Median depth of a keyframe's associated points, measured along its
    /// optical axis. Returns a negative value when the keyframe has no
    /// associated points, which callers treat as degenerate geometry.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId) -> f64 {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return -1.0;
        };
        let mut depths: Vec<f64> = kf
            .map_point_slots()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .filter(|mp| !mp.is_bad)
            .map(|mp| kf.pose.transform(&mp.position).z)
            .collect();
        if depths.is_empty() {
            return -1.0;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        depths[(depths.len() - 1) / 2]
    }

    // ── Spanning tree ────────────────────────────────────────────────────

    /// Attach a keyframe to the spanning tree under its strongest
    /// covisibility neighbor. The first keyframe stays the root.
    pub fn assign_spanning_tree_parent(&mut self, kf_id: KeyFrameId) {
        let parent = match self.keyframes.get_mut(&kf_id) {
            Some(kf) if kf.parent.is_none() => kf.best_covisibles(1).first().copied(),
            _ => None,
        };
        if let Some(parent_id) = parent {
            if parent_id != kf_id {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_parent(parent_id);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                    parent_kf.add_child(kf_id);
                }
            }
        }
    }

    /// Remove a keyframe entirely: detach observations, covisibility edges
    /// and spanning-tree links, reparenting children to the grandparent.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let slots: Vec<(usize, MapPointId)> = kf.map_point_slots().collect();
        let covisibles: Vec<KeyFrameId> = kf.covisible_keyframes().copied().collect();
        let parent = kf.parent;
        let children: Vec<KeyFrameId> = kf.children.iter().copied().collect();

        for (_, mp_id) in slots {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        match parent {
            Some(parent_id) => {
                if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                    parent_kf.erase_child(kf_id);
                }
                for child in children {
                    if let Some(child_kf) = self.keyframes.get_mut(&child) {
                        child_kf.set_parent(parent_id);
                    }
                    if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                        parent_kf.add_child(child);
                    }
                }
            }
            None => {
                // Root removal: first child becomes the new root.
                if let Some((new_root, rest)) = children.split_first() {
                    if let Some(root_kf) = self.keyframes.get_mut(new_root) {
                        root_kf.parent = None;
                    }
                    for child in rest {
                        if let Some(child_kf) = self.keyframes.get_mut(child) {
                            child_kf.set_parent(*new_root);
                        }
                        if let Some(root_kf) = self.keyframes.get_mut(new_root) {
                            root_kf.add_child(*child);
                        }
                    }
                }
            }
        }

        self.keyframes.remove(&kf_id);
        self.keyframe_order.retain(|&id| id != kf_id);
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Mark map points failing the quality criteria as bad. Returns the
    /// number culled.
    pub fn cull_map_points(&mut self, min_found_ratio: f64, min_observations: usize) -> usize {
        let victims: Vec<MapPointId> = self
            .map_points
            .values()
            .filter(|mp| {
                !mp.is_bad
                    && (mp.num_observations() < min_observations
                        || mp.found_ratio() < min_found_ratio)
            })
            .map(|mp| mp.id)
            .collect();
        let count = victims.len();
        for id in victims {
            self.set_bad_map_point(id);
        }
        count
    }

    /// Verify invariant: `(k, i) ∈ p.observations  ⇔  k.map_points[i] = p`
    /// for every live point and keyframe.
    pub fn check_observation_symmetry(&self) -> bool {
        for mp in self.map_points.values() {
            if mp.is_bad {
                continue;
            }
            for (kf_id, &idx) in &mp.observations {
                match self.keyframes.get(kf_id) {
                    Some(kf) if kf.map_point(idx) == Some(mp.id) => {}
                    _ => return false,
                }
            }
        }
        for kf in self.keyframes.values() {
            for (idx, mp_id) in kf.map_point_slots() {
                match self.map_points.get(&mp_id) {
                    Some(mp) if mp.observations.get(&kf.id) == Some(&idx) => {}
                    _ => return false,
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.keyframe_order.clear();
        self.origins.clear();
        self.reference_map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .finish()
    }
}
