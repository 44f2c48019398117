//! The tracking front-end state machine.
//!
//! One `track()` pass per input frame: predict the pose from the motion
//! filter (or the reference keyframe right after relocalization), match
//! map points by projection, refine with motion-only BA, enlarge the match
//! set against the local map, and decide on keyframe promotion. The map's
//! mutation lock is held for the entire pass; the local mapping thread
//! mutates the map between passes.

use std::sync::Arc;

use nalgebra::Matrix4;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::align::ImageAligner;
use crate::camera::PinholeCamera;
use crate::config::Config;
use crate::features::{DepthImage, FeatureExtractor, Image, ImuSample};
use crate::geometry::SE3;
use crate::local_mapping::LocalMapper;
use crate::map::map::Map;
use crate::map::types::{KeyFrameId, MapPointId};
use crate::optimize::PoseOptimizer;

use super::frame::Frame;
use super::initializer::{MonoInitializer, PatternDetector, TwoViewSolver};
use super::keyframe_policy::{KeyframeContext, KeyframePolicy};
use super::matcher::Matcher;
use super::motion::{Ekf, Measurements, SensorModel};
use super::orientation::Madgwick;
use super::state::TrackingState;
use super::Sensor;

/// Base projection-search radius in pixels.
const SEARCH_RADIUS: f64 = 32.0;
/// Angular distance (rad) between the motion prior and the orientation
/// filter above which the camera counts as "in a curve".
const CURVE_THRESHOLD: f64 = 0.02;
/// Frustum viewing-angle cosine limit.
const VIEW_COS_LIMIT: f64 = 0.5;

/// External collaborators injected into the tracker.
pub struct TrackerExternals {
    pub extractor: Box<dyn FeatureExtractor>,
    pub aligner: Box<dyn ImageAligner>,
    pub optimizer: Box<dyn PoseOptimizer>,
    pub two_view: Box<dyn TwoViewSolver>,
    pub pattern: Option<Box<dyn PatternDetector>>,
}

/// Pose of one frame relative to its reference keyframe (`T_cr`).
#[derive(Debug, Clone, Copy)]
pub struct RelativePose {
    pub frame_id: u64,
    pub reference_kf: KeyFrameId,
    pub pose: SE3,
}

pub struct Tracker {
    state: TrackingState,
    sensor: Sensor,
    camera: PinholeCamera,

    map: Arc<Mutex<Map>>,
    local_mapper: Arc<LocalMapper>,
    externals: TrackerExternals,

    policy: KeyframePolicy,
    motion_model: Ekf,
    madgwick: Madgwick,

    align_enabled: bool,
    th_depth: f64,
    depth_scale: f32,
    use_pattern: bool,

    mono_init: Option<MonoInitializer>,
    last_frame: Option<Frame>,

    next_frame_id: u64,
    last_keyframe_frame_id: u64,
    reference_kf: Option<KeyFrameId>,

    local_keyframes: Vec<KeyFrameId>,
    local_map_points: Vec<MapPointId>,

    last_reloc_frame_id: u64,
    /// `T_cr` of the last frame with a pose, and its reference keyframe.
    last_relative_pose: Option<(KeyFrameId, SE3)>,

    matches_inliers: usize,
    /// Visual-odometry points owned by the tracker for the current pass.
    temporal_points: Vec<MapPointId>,
    in_curve: bool,
    measurements: Measurements,

    only_tracking: bool,
    reset_requested: bool,

    trajectory: Vec<RelativePose>,
}

impl Tracker {
    pub fn new(
        config: &Config,
        sensor: Sensor,
        map: Arc<Mutex<Map>>,
        local_mapper: Arc<LocalMapper>,
        externals: TrackerExternals,
    ) -> Self {
        let max_frames = config.fps().round().max(1.0) as u64;
        let model = match sensor {
            Sensor::Fusion => SensorModel::Imu,
            _ => SensorModel::ConstantVelocity,
        };
        Self {
            state: TrackingState::NoImages,
            sensor,
            camera: config.pinhole(),
            map,
            local_mapper,
            externals,
            policy: KeyframePolicy {
                min_frames: 0,
                max_frames,
                th_depth: config.th_depth_m(),
                use_pattern: config.use_pattern,
            },
            motion_model: Ekf::new(model),
            madgwick: Madgwick::new(config.madgwick_gain),
            align_enabled: true,
            th_depth: config.th_depth_m(),
            depth_scale: config.depth_scale(),
            use_pattern: config.use_pattern,
            mono_init: None,
            last_frame: None,
            next_frame_id: 0,
            last_keyframe_frame_id: 0,
            reference_kf: None,
            local_keyframes: Vec::new(),
            local_map_points: Vec::new(),
            last_reloc_frame_id: 0,
            last_relative_pose: None,
            matches_inliers: 0,
            temporal_points: Vec::new(),
            in_curve: false,
            measurements: Measurements::default(),
            only_tracking: false,
            reset_requested: false,
            trajectory: Vec::new(),
        }
    }

    // ── Public per-frame operations ──────────────────────────────────────

    /// Process one grayscale frame. Returns `T_cw`, zero when not tracking.
    pub fn grab_monocular(&mut self, image: &Image, timestamp: Option<f64>) -> Matrix4<f64> {
        assert_eq!(image.channels, 1, "monocular input must be grayscale");
        self.measurements = Measurements::default();
        let features = self.externals.extractor.extract(image);
        let mut frame = Frame::monocular(self.alloc_frame_id(), image.clone(), features, self.camera);
        frame.timestamp = timestamp;
        self.run_frame(frame)
    }

    /// Process one grayscale frame with a registered depth image.
    pub fn grab_rgbd(
        &mut self,
        image: &Image,
        depth: &DepthImage,
        timestamp: Option<f64>,
    ) -> Matrix4<f64> {
        assert_eq!(image.channels, 1, "RGBD input must be grayscale");
        self.measurements = Measurements::default();
        let features = self.externals.extractor.extract(image);
        let mut frame = Frame::rgbd(
            self.alloc_frame_id(),
            image.clone(),
            depth,
            self.depth_scale,
            features,
            self.camera,
        );
        frame.timestamp = timestamp;
        self.run_frame(frame)
    }

    /// Process one grayscale frame with an inertial sample covering the
    /// `dt` seconds since the previous frame.
    pub fn grab_fusion(
        &mut self,
        image: &Image,
        dt: f64,
        imu: ImuSample,
        timestamp: Option<f64>,
    ) -> Matrix4<f64> {
        assert_eq!(image.channels, 1, "fusion input must be grayscale");
        self.measurements = Measurements { dt, imu: Some(imu) };
        let features = self.externals.extractor.extract(image);
        let mut frame = Frame::monocular(self.alloc_frame_id(), image.clone(), features, self.camera);
        frame.timestamp = timestamp;
        self.run_frame(frame)
    }

    /// Localization-only mode: the map is not expanded while set.
    pub fn inform_only_tracking(&mut self, flag: bool) {
        self.only_tracking = flag;
    }

    /// Drop the map and return to the cold state.
    pub fn reset(&mut self) {
        warn!("tracking reset");
        self.local_mapper.request_reset();
        self.map.lock().clear();

        self.state = TrackingState::NoImages;
        self.mono_init = None;
        self.last_frame = None;
        self.next_frame_id = 0;
        self.last_keyframe_frame_id = 0;
        self.reference_kf = None;
        self.local_keyframes.clear();
        self.local_map_points.clear();
        self.last_reloc_frame_id = 0;
        self.last_relative_pose = None;
        self.matches_inliers = 0;
        self.temporal_points.clear();
        self.in_curve = false;
        self.motion_model.restart();
        self.reset_requested = false;
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn matches_inliers(&self) -> usize {
        self.matches_inliers
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn last_reloc_frame_id(&self) -> u64 {
        self.last_reloc_frame_id
    }

    pub fn motion_model_started(&self) -> bool {
        self.motion_model.started()
    }

    /// Whether the last inertial prediction classified the motion as an
    /// aggressive rotation.
    pub fn in_curve(&self) -> bool {
        self.in_curve
    }

    pub fn orientation_filter(&self) -> &Madgwick {
        &self.madgwick
    }

    pub fn trajectory(&self) -> &[RelativePose] {
        &self.trajectory
    }

    /// Snapshot of the most recently processed frame.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    // ── Frame pipeline ───────────────────────────────────────────────────

    fn alloc_frame_id(&mut self) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }

    fn run_frame(&mut self, mut frame: Frame) -> Matrix4<f64> {
        self.track(&mut frame);
        if self.reset_requested {
            self.reset();
            return Matrix4::zeros();
        }
        if self.state == TrackingState::Ok {
            frame.pose_matrix()
        } else {
            Matrix4::zeros()
        }
    }

    fn track(&mut self, frame: &mut Frame) {
        if self.state == TrackingState::NoImages {
            self.state = TrackingState::NotInitialized;
        }

        let map_arc = Arc::clone(&self.map);
        // Exclusive mutation lock for the whole pass.
        let mut map = map_arc.lock();
        let map = &mut *map;

        if self.state == TrackingState::NotInitialized {
            match self.sensor {
                Sensor::Rgbd => self.rgbd_initialization(frame, map),
                _ if self.use_pattern => self.pattern_initialization(frame, map),
                _ => self.monocular_initialization(frame, map),
            }
            self.last_frame = Some(frame.clone());
            if self.state != TrackingState::Ok {
                return;
            }
        } else {
            let mut ok;
            if self.state == TrackingState::Ok {
                // Local mapping may have fused points seen by the last frame.
                self.chase_replacements_in_last_frame(map);

                if !self.motion_model.started() || frame.id < self.last_reloc_frame_id + 2 {
                    ok = self.track_reference_keyframe(frame, map);
                } else {
                    ok = match self.sensor {
                        Sensor::Fusion => self.track_with_imu_model(frame, map),
                        _ => self.track_with_motion_model(frame, map),
                    };
                    if !ok {
                        debug!("motion-model tracking failed, retrying against reference keyframe");
                        ok = self.track_reference_keyframe(frame, map);
                        self.motion_model.restart();
                    }
                }
            } else {
                ok = self.relocalization(frame, map);
                self.motion_model.restart();
            }

            frame.reference_kf = self.reference_kf;

            if ok {
                ok = self.track_local_map(frame, map);
            }

            self.state = if ok {
                TrackingState::Ok
            } else {
                debug!("tracking lost");
                TrackingState::Lost
            };

            if ok {
                // Feed the motion filter, unless the previous frame had no
                // usable pose.
                if self.last_frame.as_ref().and_then(|f| f.pose()).is_some() {
                    let pose = frame.pose().expect("tracked frame has a pose");
                    let measurements = self.measurements;
                    self.motion_model.update(&pose, &measurements);
                    self.madgwick.set_orientation_from_pose(&pose);
                } else {
                    self.motion_model.restart();
                }

                // Matches against unanchored points are visual odometry
                // only; drop them from the committed frame.
                for i in 0..frame.len() {
                    if let Some(mp_id) = frame.map_points[i] {
                        let orphan = map
                            .map_point(mp_id)
                            .map(|mp| mp.num_observations() < 1)
                            .unwrap_or(true);
                        if orphan {
                            frame.outlier[i] = false;
                            frame.map_points[i] = None;
                        }
                    }
                }
                self.destroy_temporal_points(map);

                if self.need_new_keyframe(frame, map) {
                    self.create_new_keyframe(frame, map);
                }

                // High-innovation points may still reach the keyframe above
                // for BA to arbitrate, but the next frame must not estimate
                // its pose from them.
                for i in 0..frame.len() {
                    if frame.map_points[i].is_some() && frame.outlier[i] {
                        frame.map_points[i] = None;
                    }
                }
            } else {
                self.destroy_temporal_points(map);
            }

            if self.state == TrackingState::Lost && map.keyframes_in_map() <= 5 {
                warn!("tracking lost soon after initialization, resetting");
                self.reset_requested = true;
                return;
            }

            if frame.reference_kf.is_none() {
                frame.reference_kf = self.reference_kf;
            }
            self.last_frame = Some(frame.clone());
        }

        // Relative pose bookkeeping for prediction re-anchoring and the
        // trajectory dump.
        if let (Some(pose), Some(kf_id)) = (frame.pose(), frame.reference_kf) {
            if let Some(kf_pose) = map.keyframe_pose(kf_id) {
                let t_cr = pose * kf_pose.inverse();
                self.last_relative_pose = Some((kf_id, t_cr));
                self.trajectory.push(RelativePose {
                    frame_id: frame.id,
                    reference_kf: kf_id,
                    pose: t_cr,
                });
            }
        }
    }

    // ── Initialization ───────────────────────────────────────────────────

    fn rgbd_initialization(&mut self, frame: &mut Frame, map: &mut Map) {
        if frame.valid_depth_count() <= 500 {
            return;
        }

        // The first keyframe defines the world frame.
        frame.set_pose(SE3::identity());
        let kf_id = map.insert_keyframe_from_frame(frame);

        for i in 0..frame.len() {
            if frame.depth[i] <= 0.0 {
                continue;
            }
            let Some(x3d) = frame.unproject_to_world(i) else {
                continue;
            };
            let mp_id = map.create_map_point(x3d, frame.descriptors[i], kf_id);
            map.associate(kf_id, i, mp_id);
            map.update_point_geometry(mp_id);
            frame.map_points[i] = Some(mp_id);
        }

        debug!(points = map.map_points_in_map(), "new map created");
        map.add_origin(kf_id);
        self.finish_initialization(frame, map, kf_id, &[kf_id]);
    }

    fn monocular_initialization(&mut self, frame: &mut Frame, map: &mut Map) {
        let Some(mut init) = self.mono_init.take() else {
            // Stage A: store the first sufficiently featured frame.
            if frame.len() > 100 {
                self.mono_init = Some(MonoInitializer::new(frame.clone()));
            }
            return;
        };

        // Stage B: match against the stored reference and try to solve.
        if frame.len() <= 100 {
            return;
        }

        let matcher = Matcher::new(0.9, true);
        let (nmatches, matches) =
            matcher.search_for_initialization(&init.reference, frame, &mut init.prev_matched, 100.0);
        if nmatches < 100 {
            debug!(nmatches, "not enough bootstrap matches, restarting initializer");
            return;
        }
        init.matches = matches;

        let Some(recon) = self
            .externals
            .two_view
            .reconstruct(&init.reference, frame, &init.matches)
        else {
            // Geometry not solvable yet; keep the reference and retry.
            self.mono_init = Some(init);
            return;
        };

        let mut nmatches = nmatches;
        for (i1, m) in init.matches.iter_mut().enumerate() {
            if *m >= 0 && !recon.triangulated.get(i1).copied().unwrap_or(false) {
                *m = -1;
                nmatches -= 1;
            }
        }
        debug!(nmatches, "two-view reconstruction accepted");

        init.reference.set_pose(SE3::identity());
        frame.set_pose(SE3::new(recon.rotation, recon.translation));

        let kf_ini = map.insert_keyframe_from_frame(&init.reference);
        let kf_cur = map.insert_keyframe_from_frame(frame);

        for (i1, &i2) in init.matches.iter().enumerate() {
            if i2 < 0 {
                continue;
            }
            let i2 = i2 as usize;
            // Reference camera frame coincides with the world frame.
            let mp_id = map.create_map_point(recon.points[i1], frame.descriptors[i2], kf_cur);
            map.associate(kf_ini, i1, mp_id);
            map.associate(kf_cur, i2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_point_geometry(mp_id);
            frame.map_points[i2] = Some(mp_id);
            frame.outlier[i2] = false;
        }
        map.assign_spanning_tree_parent(kf_cur);

        debug!(points = map.map_points_in_map(), "new map created");
        self.externals.optimizer.global_ba(map, 20);

        // Gauge fixing: the unobservable global scale is pinned by forcing
        // the initial median scene depth to one.
        let median_depth = map.scene_median_depth(kf_ini);
        if median_depth <= 0.0 || map.tracked_map_points(kf_cur, 1) < 100 {
            error!(median_depth, "degenerate initialization, resetting");
            self.reset_requested = true;
            return;
        }
        let inv_depth = 1.0 / median_depth;

        if let Some(kf) = map.keyframe_mut(kf_cur) {
            kf.pose.translation *= inv_depth;
        }
        let point_ids: Vec<MapPointId> = map
            .keyframe(kf_ini)
            .map(|kf| kf.map_point_slots().map(|(_, id)| id).collect())
            .unwrap_or_default();
        for mp_id in point_ids {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.position *= inv_depth;
            }
            map.update_point_geometry(mp_id);
        }

        let scaled_pose = map.keyframe_pose(kf_cur).expect("keyframe just created");
        frame.set_pose(scaled_pose);

        map.add_origin(kf_ini);
        self.finish_initialization(frame, map, kf_cur, &[kf_ini, kf_cur]);
    }

    fn pattern_initialization(&mut self, frame: &mut Frame, map: &mut Map) {
        if frame.len() <= 500 {
            return;
        }
        let Some(detection) = self
            .externals
            .pattern
            .as_ref()
            .and_then(|d| d.detect(frame))
        else {
            return;
        };

        frame.set_pose(SE3::identity());
        let kf_id = map.insert_keyframe_from_frame(frame);

        let pattern_from_camera = detection.camera_from_pattern.inverse();
        for &(idx, ref point) in &detection.points {
            if idx >= frame.len() {
                continue;
            }
            let world = pattern_from_camera.transform(point);
            let mp_id = map.create_map_point(world, frame.descriptors[idx], kf_id);
            map.associate(kf_id, idx, mp_id);
            map.update_point_geometry(mp_id);
            frame.map_points[idx] = Some(mp_id);
        }

        debug!(points = map.map_points_in_map(), "new map created from pattern");
        map.add_origin(kf_id);
        self.finish_initialization(frame, map, kf_id, &[kf_id]);
    }

    /// Shared bootstrap tail: local map seeding, queue submission, state.
    fn finish_initialization(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        reference: KeyFrameId,
        submitted: &[KeyFrameId],
    ) {
        for &kf_id in submitted {
            self.local_mapper.insert_keyframe(kf_id);
        }
        self.last_keyframe_frame_id = frame.id;

        self.local_keyframes = submitted.to_vec();
        self.local_map_points = map.all_map_points().map(|mp| mp.id).collect();
        map.set_reference_map_points(self.local_map_points.clone());

        self.reference_kf = Some(reference);
        frame.reference_kf = Some(reference);
        self.state = TrackingState::Ok;
    }

    // ── Pose tracking paths ──────────────────────────────────────────────

    fn chase_replacements_in_last_frame(&mut self, map: &Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        for slot in last.map_points.iter_mut() {
            if let Some(mp_id) = *slot {
                match map.map_point(mp_id) {
                    Some(mp) => {
                        if let Some(replacement) = mp.replaced_by {
                            *slot = Some(replacement);
                        }
                    }
                    None => *slot = None,
                }
            }
        }
    }

    fn track_reference_keyframe(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let Some(ref_kf_id) = self.reference_kf else {
            return false;
        };
        let Some(seed) = self.last_frame.as_ref().and_then(|f| f.pose()) else {
            return false;
        };
        frame.set_pose(seed);

        if self.align_enabled {
            if let Some(kf) = map.keyframe(ref_kf_id) {
                match self.externals.aligner.align_to_keyframe(frame, kf, false) {
                    Some(refined) => frame.set_pose(refined),
                    None => {
                        error!("image alignment failed");
                        frame.set_pose(seed);
                    }
                }
            }
        }

        let matcher = Matcher::new(0.7, true);
        frame.clear_matches();
        let mut nmatches = match map.keyframe(ref_kf_id) {
            Some(kf) => matcher.search_by_projection_from_keyframe(frame, kf, map, SEARCH_RADIUS),
            None => 0,
        };

        // Too few matches: forget the alignment and search a wider window
        // around the last frame instead.
        if nmatches < 20 {
            debug!(nmatches, "few reference matches, doubling search radius");
            frame.set_pose(seed);
            frame.clear_matches();
            if let Some(last) = self.last_frame.as_ref() {
                nmatches =
                    matcher.search_by_projection_from_frame(frame, last, map, 2.0 * SEARCH_RADIUS);
            }
        }
        if nmatches < 20 {
            debug!(nmatches, "reference-keyframe tracking failed");
            return false;
        }

        self.externals.optimizer.pose_optimization(frame, map);
        let inliers = discard_outliers(frame, map);
        if inliers < 10 {
            debug!(inliers, "reference-keyframe tracking failed after optimization");
            return false;
        }
        true
    }

    /// Re-anchor the last frame's pose against its (possibly adjusted)
    /// reference keyframe, and in RGBD mode seed temporary visual-odometry
    /// points for close unmapped depth samples.
    fn update_last_frame(&mut self, map: &mut Map) {
        let Some((kf_id, t_cr)) = self.last_relative_pose else {
            return;
        };
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if last.reference_kf == Some(kf_id) {
            if let Some(kf_pose) = map.keyframe_pose(kf_id) {
                last.set_pose(t_cr * kf_pose);
            }
        }

        if self.sensor != Sensor::Rgbd {
            return;
        }

        // Close depth samples without an anchored map point become
        // temporary points, owned by the tracker until the pass ends.
        let mut depth_order: Vec<(f32, usize)> = last
            .depth
            .iter()
            .enumerate()
            .filter(|&(_, &z)| z > 0.0)
            .map(|(i, &z)| (z, i))
            .collect();
        if depth_order.is_empty() {
            return;
        }
        depth_order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let reference = last.reference_kf.unwrap_or(KeyFrameId(0));
        let mut n_points = 0usize;
        for &(z, i) in &depth_order {
            let create = match last.map_points[i] {
                None => true,
                Some(mp_id) => map
                    .map_point(mp_id)
                    .map(|mp| mp.num_observations() < 1)
                    .unwrap_or(true),
            };
            if create {
                if let Some(x3d) = last.unproject_to_world(i) {
                    let mp_id = map.create_map_point(x3d, last.descriptors[i], reference);
                    last.map_points[i] = Some(mp_id);
                    self.temporal_points.push(mp_id);
                }
            }
            n_points += 1;
            if z as f64 > self.th_depth && n_points > 100 {
                break;
            }
        }
    }

    fn track_with_motion_model(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        self.update_last_frame(map);
        let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose()) else {
            return false;
        };
        let predicted = self.motion_model.predict(&last_pose);
        self.track_visual(frame, predicted, map)
    }

    fn track_with_imu_model(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        self.update_last_frame(map);
        let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose()) else {
            return false;
        };
        let mut predicted = self.motion_model.predict(&last_pose);

        if let Some(imu) = self.measurements.imu {
            self.madgwick
                .update(&imu.accel, &imu.gyro, self.measurements.dt);
        }

        // Sharp rotation: the gyro-backed filter is more trustworthy than
        // the constant-rate extrapolation, so its rotation replaces the
        // predicted block; translation is kept.
        let filter_rotation = self.madgwick.local_orientation();
        let angle = last_pose.rotation.angle_to(&filter_rotation);
        self.in_curve = angle > CURVE_THRESHOLD;
        if self.in_curve {
            debug!(angle, "in curve, substituting filter orientation");
            predicted = SE3::new(filter_rotation, predicted.translation);
        }

        self.track_visual(frame, predicted, map)
    }

    /// Shared visual tracking against the last frame from a predicted pose.
    fn track_visual(&mut self, frame: &mut Frame, predicted: SE3, map: &mut Map) -> bool {
        frame.set_pose(predicted);

        if self.align_enabled {
            if let Some(last) = self.last_frame.as_ref() {
                match self.externals.aligner.align_to_frame(frame, last) {
                    Some(refined) => frame.set_pose(refined),
                    None => {
                        error!("image alignment failed");
                        frame.set_pose(predicted);
                    }
                }
            }
        }

        let matcher = Matcher::new(0.9, true);
        frame.clear_matches();
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };
        let mut nmatches = matcher.search_by_projection_from_frame(frame, last, map, SEARCH_RADIUS);

        if nmatches < 20 {
            debug!(nmatches, "few matches, doubling search radius");
            frame.set_pose(predicted);
            frame.clear_matches();
            nmatches =
                matcher.search_by_projection_from_frame(frame, last, map, 2.0 * SEARCH_RADIUS);
        }
        if nmatches < 20 {
            debug!(nmatches, "motion-model tracking failed");
            return false;
        }

        self.externals.optimizer.pose_optimization(frame, map);
        let inliers = discard_outliers(frame, map);
        if inliers < 10 {
            debug!(inliers, "motion-model tracking failed after optimization");
            return false;
        }
        true
    }

    // ── Local map ────────────────────────────────────────────────────────

    fn track_local_map(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        self.update_local_keyframes(frame, map);
        self.update_local_points(frame, map);
        map.set_reference_map_points(self.local_map_points.clone());

        self.search_local_points(frame, map);
        self.externals.optimizer.pose_optimization(frame, map);

        self.matches_inliers = 0;
        for i in 0..frame.len() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            if frame.outlier[i] {
                continue;
            }
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_found();
                if mp.num_observations() > 0 {
                    self.matches_inliers += 1;
                }
            }
        }

        if self.matches_inliers < 15 {
            debug!(inliers = self.matches_inliers, "local-map tracking failed");
            return false;
        }
        true
    }

    /// Rebuild the local keyframe set: every keyframe observing a currently
    /// matched point votes, then one covisibility neighbor, one child and
    /// the parent of each voter are pulled in, capped at 80. The strongest
    /// voter becomes the new reference keyframe.
    fn update_local_keyframes(&mut self, frame: &mut Frame, map: &mut Map) {
        let mut votes: Vec<(KeyFrameId, usize)> = Vec::new();
        {
            let mut counter = std::collections::HashMap::<KeyFrameId, usize>::new();
            for i in 0..frame.len() {
                let Some(mp_id) = frame.map_points[i] else {
                    continue;
                };
                match map.map_point(mp_id) {
                    Some(mp) if !mp.is_bad => {
                        for kf_id in mp.observations.keys() {
                            *counter.entry(*kf_id).or_insert(0) += 1;
                        }
                    }
                    _ => frame.map_points[i] = None,
                }
            }
            votes.extend(counter);
        }
        if votes.is_empty() {
            return;
        }
        // Deterministic order: best first, ties by id.
        votes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        self.local_keyframes.clear();
        let mut best: Option<KeyFrameId> = None;
        for &(kf_id, _) in &votes {
            let Some(kf) = map.keyframe_mut(kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }
            kf.track_reference_frame = frame.id;
            if best.is_none() {
                best = Some(kf_id);
            }
            self.local_keyframes.push(kf_id);
        }

        let voter_count = self.local_keyframes.len();
        for idx in 0..voter_count {
            if self.local_keyframes.len() > 80 {
                break;
            }
            let kf_id = self.local_keyframes[idx];

            let neighbors = match map.keyframe_mut(kf_id) {
                Some(kf) => kf.best_covisibles(10),
                None => continue,
            };
            for neighbor in neighbors {
                if self.try_add_local_keyframe(neighbor, frame.id, map) {
                    break;
                }
            }

            let children: Vec<KeyFrameId> = map
                .keyframe(kf_id)
                .map(|kf| kf.children.iter().copied().collect())
                .unwrap_or_default();
            for child in children {
                if self.try_add_local_keyframe(child, frame.id, map) {
                    break;
                }
            }

            if let Some(parent) = map.keyframe(kf_id).and_then(|kf| kf.parent) {
                self.try_add_local_keyframe(parent, frame.id, map);
            }
        }

        if let Some(best) = best {
            self.reference_kf = Some(best);
            frame.reference_kf = Some(best);
        }
    }

    fn try_add_local_keyframe(&mut self, kf_id: KeyFrameId, frame_id: u64, map: &mut Map) -> bool {
        let Some(kf) = map.keyframe_mut(kf_id) else {
            return false;
        };
        if kf.is_bad || kf.track_reference_frame == frame_id {
            return false;
        }
        kf.track_reference_frame = frame_id;
        self.local_keyframes.push(kf_id);
        true
    }

    /// Union of the map points observed by the local keyframes,
    /// deduplicated with a per-frame marker.
    fn update_local_points(&mut self, frame: &Frame, map: &mut Map) {
        self.local_map_points.clear();
        let keyframes = self.local_keyframes.clone();
        for kf_id in keyframes {
            let slots: Vec<MapPointId> = map
                .keyframe(kf_id)
                .map(|kf| kf.map_point_slots().map(|(_, id)| id).collect())
                .unwrap_or_default();
            for mp_id in slots {
                let Some(mp) = map.map_point_mut(mp_id) else {
                    continue;
                };
                if mp.track_reference_frame == frame.id || mp.is_bad {
                    continue;
                }
                mp.track_reference_frame = frame.id;
                self.local_map_points.push(mp_id);
            }
        }
    }

    /// Project unmatched local points into the frame and search for
    /// additional descriptor matches.
    fn search_local_points(&mut self, frame: &mut Frame, map: &mut Map) {
        // Points already matched: count visibility, exclude from search.
        for i in 0..frame.len() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            match map.map_point_mut(mp_id) {
                Some(mp) if !mp.is_bad => {
                    mp.increase_visible();
                    mp.last_frame_seen = frame.id;
                    mp.track_in_view = false;
                }
                _ => frame.map_points[i] = None,
            }
        }

        let mut to_match = 0usize;
        for &mp_id in &self.local_map_points {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.last_frame_seen == frame.id || mp.is_bad {
                continue;
            }
            match frame.check_frustum(mp, VIEW_COS_LIMIT) {
                Some(hit) => {
                    let mp = map.map_point_mut(mp_id).expect("checked above");
                    mp.track_in_view = true;
                    mp.track_proj_x = hit.u;
                    mp.track_proj_y = hit.v;
                    mp.track_octave = hit.predicted_octave;
                    mp.track_view_cos = hit.view_cos;
                    mp.increase_visible();
                    to_match += 1;
                }
                None => {
                    if let Some(mp) = map.map_point_mut(mp_id) {
                        mp.track_in_view = false;
                    }
                }
            }
        }

        if to_match > 0 {
            let matcher = Matcher::new(0.8, false);
            let th = if frame.id < self.last_reloc_frame_id + 2 {
                // Coarse search right after relocalization.
                5.0
            } else if self.sensor == Sensor::Rgbd {
                3.0
            } else {
                1.0
            };
            matcher.search_by_projection_local(frame, &self.local_map_points, map, th);
        }
    }

    // ── Relocalization ───────────────────────────────────────────────────

    fn relocalization(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let matcher = Matcher::new(0.75, true);
        let candidates: Vec<KeyFrameId> = map.all_keyframes().to_vec();

        for kf_id in candidates.into_iter().rev() {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }

            frame.set_pose(kf.pose);
            let Some(aligned) = self.externals.aligner.align_to_keyframe(frame, kf, true) else {
                continue;
            };
            frame.set_pose(aligned);

            frame.clear_matches();
            let nmatches = matcher.search_by_projection_from_keyframe(frame, kf, map, SEARCH_RADIUS);
            if nmatches < 20 {
                continue;
            }

            let inliers = self.externals.optimizer.pose_optimization(frame, map);
            if inliers < 10 {
                continue;
            }

            debug!(candidate = %kf_id, inliers, "relocalized");
            self.last_reloc_frame_id = frame.id;
            return true;
        }
        false
    }

    // ── Keyframe admission ───────────────────────────────────────────────

    fn need_new_keyframe(&self, frame: &Frame, map: &Map) -> bool {
        let ctx = KeyframeContext {
            frame,
            map,
            local_mapper: &*self.local_mapper,
            sensor: self.sensor,
            reference_kf: self.reference_kf,
            matches_inliers: self.matches_inliers,
            last_keyframe_frame_id: self.last_keyframe_frame_id,
            last_reloc_frame_id: self.last_reloc_frame_id,
            only_tracking: self.only_tracking,
        };
        self.policy.need_new_keyframe(&ctx)
    }

    fn create_new_keyframe(&mut self, frame: &mut Frame, map: &mut Map) {
        // A concurrent stop request wins over this insertion.
        if !self.local_mapper.set_not_stop(true) {
            return;
        }

        let kf_id = map.insert_keyframe_from_frame(frame);

        // Anchor the frame's surviving matches as observations.
        for i in 0..frame.len() {
            if frame.outlier[i] {
                continue;
            }
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            if map.map_point(mp_id).is_some_and(|mp| !mp.is_bad) {
                map.associate(kf_id, i, mp_id);
                map.compute_distinctive_descriptor(mp_id);
                map.update_point_geometry(mp_id);
            }
        }
        map.assign_spanning_tree_parent(kf_id);

        self.reference_kf = Some(kf_id);
        frame.reference_kf = Some(kf_id);

        if self.sensor == Sensor::Rgbd {
            self.create_close_depth_points(frame, map, kf_id);
        }

        debug!(keyframe = %kf_id, "new keyframe");
        self.local_mapper.insert_keyframe(kf_id);
        self.local_mapper.set_not_stop(false);
        self.last_keyframe_frame_id = frame.id;
    }

    /// Unproject novel close-depth samples into map points: everything
    /// below the depth threshold, or the 100 closest when fewer qualify.
    fn create_close_depth_points(&mut self, frame: &mut Frame, map: &mut Map, kf_id: KeyFrameId) {
        let mut depth_order: Vec<(f32, usize)> = frame
            .depth
            .iter()
            .enumerate()
            .filter(|&(_, &z)| z > 0.0)
            .map(|(i, &z)| (z, i))
            .collect();
        if depth_order.is_empty() {
            return;
        }
        depth_order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut n_points = 0usize;
        for &(z, i) in &depth_order {
            let create = match frame.map_points[i] {
                None => true,
                Some(mp_id) => {
                    let orphan = map
                        .map_point(mp_id)
                        .map(|mp| mp.num_observations() < 1)
                        .unwrap_or(true);
                    if orphan {
                        frame.map_points[i] = None;
                    }
                    orphan
                }
            };

            if create {
                if let Some(x3d) = frame.unproject_to_world(i) {
                    let mp_id = map.create_map_point(x3d, frame.descriptors[i], kf_id);
                    map.associate(kf_id, i, mp_id);
                    map.update_point_geometry(mp_id);
                    frame.map_points[i] = Some(mp_id);
                }
            }
            n_points += 1;

            if z as f64 > self.th_depth && n_points > 100 {
                break;
            }
        }
    }

    /// Temporary visual-odometry points never outlive the pass that used
    /// them, whether tracking succeeded or not.
    fn destroy_temporal_points(&mut self, map: &mut Map) {
        for mp_id in std::mem::take(&mut self.temporal_points) {
            map.set_bad_map_point(mp_id);
        }
    }
}

fn discard_outliers(frame: &mut Frame, map: &mut Map) -> usize {
    let mut inliers_with_observations = 0usize;
    for i in 0..frame.len() {
        let Some(mp_id) = frame.map_points[i] else {
            continue;
        };
        if frame.outlier[i] {
            frame.map_points[i] = None;
            frame.outlier[i] = false;
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.track_in_view = false;
                mp.last_frame_seen = frame.id;
            }
        } else if map
            .map_point(mp_id)
            .map(|mp| mp.num_observations())
            .unwrap_or(0)
            > 0
        {
            inliers_with_observations += 1;
        }
    }
    inliers_with_observations
}
