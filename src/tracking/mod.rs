//! Tracking front-end: per-frame pose estimation and keyframe admission.

pub mod frame;
pub mod initializer;
pub mod keyframe_policy;
pub mod matcher;
pub mod motion;
pub mod orientation;
pub mod state;
pub mod tracker;

pub use state::TrackingState;
pub use tracker::{RelativePose, Tracker, TrackerExternals};

/// Sensor configuration the tracker is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    /// Single grayscale camera.
    Monocular,
    /// Grayscale camera with registered per-pixel depth.
    Rgbd,
    /// Grayscale camera fused with an IMU.
    Fusion,
}
