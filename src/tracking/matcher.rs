//! Projection-based descriptor matching.
//!
//! All searches follow the same scheme: project a 3D point into the
//! current frame, gather candidate keypoints inside a scale-dependent
//! window, and accept the best Hamming match subject to an absolute
//! threshold, a best/second-best ratio test, and optional rotation
//! consistency voting.

use crate::map::map::Map;
use crate::map::keyframe::KeyFrame;
use crate::map::types::MapPointId;

use super::frame::Frame;

/// Descriptor distance ceiling for projection searches.
const TH_HIGH: u32 = 100;
/// Stricter ceiling for bootstrap matching.
const TH_LOW: u32 = 50;
/// Rotation-consistency histogram bins.
const HISTO_LENGTH: usize = 30;

pub struct Matcher {
    nn_ratio: f32,
    check_orientation: bool,
}

impl Matcher {
    pub fn new(nn_ratio: f32, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    /// Match the current frame against a keyframe's map points by
    /// projection. Writes accepted matches into the frame's map point
    /// slots and returns the match count.
    pub fn search_by_projection_from_keyframe(
        &self,
        frame: &mut Frame,
        kf: &KeyFrame,
        map: &Map,
        radius: f64,
    ) -> usize {
        let sources: Vec<(usize, MapPointId)> = kf
            .map_point_slots()
            .filter_map(|(i, id)| map.resolve(id).map(|live| (i, live)))
            .collect();
        self.project_and_match(frame, kf.scale_factor, &sources, |i| kf.keypoints[i], map, radius)
    }

    /// Match the current frame against the previous frame's map points.
    pub fn search_by_projection_from_frame(
        &self,
        frame: &mut Frame,
        last: &Frame,
        map: &Map,
        radius: f64,
    ) -> usize {
        let sources: Vec<(usize, MapPointId)> = last
            .map_points
            .iter()
            .enumerate()
            .filter(|(i, _)| !last.outlier[*i])
            .filter_map(|(i, mp)| mp.and_then(|id| map.resolve(id)).map(|live| (i, live)))
            .collect();
        self.project_and_match(
            frame,
            last.scale_factor,
            &sources,
            |i| last.keypoints[i],
            map,
            radius,
        )
    }

    fn project_and_match(
        &self,
        frame: &mut Frame,
        source_scale_factor: f64,
        sources: &[(usize, MapPointId)],
        source_keypoint: impl Fn(usize) -> crate::features::KeyPoint,
        map: &Map,
        radius: f64,
    ) -> usize {
        let Some(pose) = frame.pose() else {
            return 0;
        };

        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut matched: Vec<usize> = Vec::new();
        let mut n_matches = 0usize;

        for &(src_idx, mp_id) in sources {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }

            let p_cam = pose.transform(&mp.position);
            let Some((u, v)) = frame.camera.project(&p_cam) else {
                continue;
            };
            if !frame.camera.is_in_image(u, v) {
                continue;
            }

            let src_kp = source_keypoint(src_idx);
            let octave = src_kp.octave;
            let search_radius = radius * source_scale_factor.powi(octave.max(0));
            let candidates = frame.features_in_area(
                u,
                v,
                search_radius,
                Some(octave - 1),
                Some(octave + 1),
            );
            if candidates.is_empty() {
                continue;
            }

            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for &idx in &candidates {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = mp.descriptor.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    second = best.0;
                    best = (dist, idx);
                } else if dist < second {
                    second = dist;
                }
            }

            if best.0 > TH_HIGH || best.1 == usize::MAX {
                continue;
            }
            if second != u32::MAX && best.0 as f32 > self.nn_ratio * second as f32 {
                continue;
            }

            frame.map_points[best.1] = Some(mp_id);
            matched.push(best.1);
            n_matches += 1;

            if self.check_orientation {
                let bin = rotation_bin(src_kp.angle, frame.keypoints[best.1].angle);
                rot_hist[bin].push(best.1);
            }
        }

        if self.check_orientation {
            n_matches -= prune_by_rotation(&rot_hist, |idx| {
                frame.map_points[idx] = None;
                true
            });
        }
        n_matches
    }

    /// Match projected local map points using the per-point frustum scratch
    /// (`track_proj_*`, `track_octave`, `track_view_cos`) filled during
    /// visibility testing. `th` scales the base search radius.
    pub fn search_by_projection_local(
        &self,
        frame: &mut Frame,
        local_points: &[MapPointId],
        map: &Map,
        th: f64,
    ) -> usize {
        let mut n_matches = 0usize;

        for &mp_id in local_points {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if !mp.track_in_view || mp.is_bad {
                continue;
            }

            // Tighter window when the point is viewed nearly head-on.
            let base = if mp.track_view_cos > 0.998 { 2.5 } else { 4.0 };
            let radius = th * base * frame.scale_factor.powi(mp.track_octave.max(0));
            let candidates = frame.features_in_area(
                mp.track_proj_x,
                mp.track_proj_y,
                radius,
                Some(mp.track_octave - 1),
                Some(mp.track_octave + 1),
            );
            if candidates.is_empty() {
                continue;
            }

            let mut best = (u32::MAX, usize::MAX, 0i32);
            let mut second = (u32::MAX, 0i32);
            for &idx in &candidates {
                // Slots filled earlier in the pipeline stay untouched if the
                // point is still anchored in the map.
                if let Some(existing) = frame.map_points[idx] {
                    if map
                        .map_point(existing)
                        .is_some_and(|p| p.num_observations() > 0)
                    {
                        continue;
                    }
                }
                let dist = mp.descriptor.distance(&frame.descriptors[idx]);
                let level = frame.keypoints[idx].octave;
                if dist < best.0 {
                    second = (best.0, best.2);
                    best = (dist, idx, level);
                } else if dist < second.0 {
                    second = (dist, level);
                }
            }

            if best.0 > TH_HIGH || best.1 == usize::MAX {
                continue;
            }
            // Ratio test only discriminates within the same pyramid level.
            if second.0 != u32::MAX
                && best.2 == second.1
                && best.0 as f32 > self.nn_ratio * second.0 as f32
            {
                continue;
            }

            frame.map_points[best.1] = Some(mp_id);
            n_matches += 1;
        }
        n_matches
    }

    /// Bootstrap matching between the two initialization views. Searches a
    /// fixed window around the previously matched position, level 0 only.
    /// Returns the match count and, per reference keypoint, the matched
    /// current-frame keypoint index (`-1` when unmatched).
    pub fn search_for_initialization(
        &self,
        reference: &Frame,
        current: &Frame,
        prev_matched: &mut [(f32, f32)],
        window: f64,
    ) -> (usize, Vec<i32>) {
        let n1 = reference.len();
        let mut matches12 = vec![-1i32; n1];
        let mut matches21 = vec![-1i32; current.len()];
        let mut match_dist = vec![u32::MAX; current.len()];
        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut n_matches = 0usize;

        for i1 in 0..n1 {
            let kp1 = reference.keypoints[i1];
            if kp1.octave != 0 {
                continue;
            }
            let (pu, pv) = prev_matched[i1];
            let candidates =
                current.features_in_area(pu as f64, pv as f64, window, Some(0), Some(0));
            if candidates.is_empty() {
                continue;
            }

            let d1 = &reference.descriptors[i1];
            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for &i2 in &candidates {
                let dist = d1.distance(&current.descriptors[i2]);
                if match_dist[i2] <= dist {
                    continue;
                }
                if dist < best.0 {
                    second = best.0;
                    best = (dist, i2);
                } else if dist < second {
                    second = dist;
                }
            }

            if best.0 > TH_LOW || best.1 == usize::MAX {
                continue;
            }
            if second != u32::MAX && best.0 as f32 > self.nn_ratio * second as f32 {
                continue;
            }

            // Steal the target from a weaker earlier match.
            if matches21[best.1] >= 0 {
                let prev = matches21[best.1] as usize;
                matches12[prev] = -1;
                n_matches -= 1;
            }
            matches12[i1] = best.1 as i32;
            matches21[best.1] = i1 as i32;
            match_dist[best.1] = best.0;
            n_matches += 1;

            if self.check_orientation {
                let bin = rotation_bin(kp1.angle, current.keypoints[best.1].angle);
                rot_hist[bin].push(i1);
            }
        }

        if self.check_orientation {
            n_matches -= prune_by_rotation(&rot_hist, |i1| {
                if matches12[i1] >= 0 {
                    matches21[matches12[i1] as usize] = -1;
                    matches12[i1] = -1;
                    true
                } else {
                    false
                }
            });
        }

        for (i1, &i2) in matches12.iter().enumerate() {
            if i2 >= 0 {
                let kp2 = current.keypoints[i2 as usize];
                prev_matched[i1] = (kp2.x, kp2.y);
            }
        }

        (n_matches, matches12)
    }
}

fn rotation_bin(angle1: f32, angle2: f32) -> usize {
    let mut rot = angle1 - angle2;
    if rot < 0.0 {
        rot += 360.0;
    }
    let bin = (rot * HISTO_LENGTH as f32 / 360.0).round() as usize;
    bin % HISTO_LENGTH
}

/// Keep matches voting for the three dominant rotation bins, discard the
/// rest through `discard`. Returns the number actually discarded.
fn prune_by_rotation(hist: &[Vec<usize>], mut discard: impl FnMut(usize) -> bool) -> usize {
    let mut best = [usize::MAX; 3];
    let mut counts = [0usize; 3];
    for (bin, entries) in hist.iter().enumerate() {
        let n = entries.len();
        if n > counts[0] {
            counts = [n, counts[0], counts[1]];
            best = [bin, best[0], best[1]];
        } else if n > counts[1] {
            counts = [counts[0], n, counts[1]];
            best = [best[0], bin, best[1]];
        } else if n > counts[2] {
            counts[2] = n;
            best[2] = bin;
        }
    }

    // Minor bins far below the dominant one are dropped entirely.
    let mut discarded = 0usize;
    for (bin, entries) in hist.iter().enumerate() {
        if bin == best[0] {
            continue;
        }
        let keep = (bin == best[1] || bin == best[2])
            && (entries.len() as f32) >= 0.1 * counts[0] as f32;
        if !keep {
            for &idx in entries {
                if discard(idx) {
                    discarded += 1;
                }
            }
        }
    }
    discarded
}
