//! Keyframe admission predicate.

use crate::local_mapping::LocalMapper;
use crate::map::map::Map;
use crate::map::types::KeyFrameId;

use super::frame::Frame;
use super::Sensor;

/// Everything the admission predicate looks at for one frame.
pub struct KeyframeContext<'a> {
    pub frame: &'a Frame,
    pub map: &'a Map,
    pub local_mapper: &'a LocalMapper,
    pub sensor: Sensor,
    pub reference_kf: Option<KeyFrameId>,
    /// Inlier count from the local-map refinement.
    pub matches_inliers: usize,
    pub last_keyframe_frame_id: u64,
    pub last_reloc_frame_id: u64,
    pub only_tracking: bool,
}

/// Decides whether the current frame becomes a keyframe.
pub struct KeyframePolicy {
    /// Minimum frames between keyframes.
    pub min_frames: u64,
    /// Maximum frames between keyframes (defaults to the camera fps).
    pub max_frames: u64,
    /// Close-point depth threshold in meters (RGBD).
    pub th_depth: f64,
    pub use_pattern: bool,
}

impl KeyframePolicy {
    pub fn need_new_keyframe(&self, ctx: &KeyframeContext) -> bool {
        if ctx.only_tracking {
            return false;
        }
        // Local mapping frozen by a loop closure: never insert.
        if ctx.local_mapper.is_stopped() || ctx.local_mapper.stop_requested() {
            return false;
        }

        let n_kfs = ctx.map.keyframes_in_map() as u64;

        // Right after relocalization a mature map gets no new keyframes.
        if ctx.frame.id < ctx.last_reloc_frame_id + self.max_frames && n_kfs > self.max_frames {
            return false;
        }

        // Tracked points in the reference keyframe, with the observation
        // minimum relaxed while the map is young.
        let mut min_obs = 3;
        if n_kfs <= 2 {
            min_obs = 2;
        }
        if n_kfs == 1 && self.use_pattern {
            min_obs = 1;
        }
        let ref_matches = ctx
            .reference_kf
            .map(|kf| ctx.map.tracked_map_points(kf, min_obs))
            .unwrap_or(0);

        let idle = ctx.local_mapper.accept_keyframes();

        // Close-depth bookkeeping (RGBD only): how many close points are
        // tracked and how many more the depth sensor could contribute.
        let mut tracked_close = 0usize;
        let mut untracked_close = 0usize;
        if ctx.sensor == Sensor::Rgbd {
            for i in 0..ctx.frame.len() {
                let z = ctx.frame.depth[i] as f64;
                if z > 0.0 && z < self.th_depth {
                    if ctx.frame.map_points[i].is_some() && !ctx.frame.outlier[i] {
                        tracked_close += 1;
                    } else {
                        untracked_close += 1;
                    }
                }
            }
        }
        let need_close = tracked_close < 100 && untracked_close > 70;

        let th_ref_ratio = if ctx.sensor != Sensor::Rgbd {
            0.9
        } else if n_kfs < 2 {
            0.4
        } else {
            0.75
        };

        let inliers = ctx.matches_inliers as f64;
        let c1a = ctx.frame.id >= ctx.last_keyframe_frame_id + self.max_frames;
        let c1b = ctx.frame.id >= ctx.last_keyframe_frame_id + self.min_frames && idle;
        let c1c = ctx.sensor == Sensor::Rgbd
            && (inliers < ref_matches as f64 * 0.25 || need_close);
        let c2 = (inliers < ref_matches as f64 * th_ref_ratio || need_close)
            && ctx.matches_inliers > 15;

        if !((c1a || c1b || c1c) && c2) {
            return false;
        }

        if idle {
            return true;
        }

        // Mapping is busy: ask it to wrap up the current BA. RGBD can
        // tolerate a short queue; monocular defers.
        ctx.local_mapper.interrupt_ba();
        ctx.sensor == Sensor::Rgbd && ctx.local_mapper.keyframes_in_queue() < 3
    }
}
