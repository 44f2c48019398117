//! Motion prediction filter.
//!
//! A small error-state EKF over the camera's frame-to-frame motion. Two
//! sensor models feed the same filter: a constant-velocity model for pure
//! visual modes, and an inertial model that drives the rotational part of
//! the prediction with the latest gyroscope reading. Poses are `T_cw`, so
//! the filtered motion is the left-composed relative transform
//! `delta = T_cw(k) * T_cw(k-1)^-1`.

use nalgebra::{Matrix6, UnitQuaternion, Vector3, Vector6};

use crate::features::ImuSample;
use crate::geometry::SE3;

/// Sensor model variants feeding the EKF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorModel {
    /// Constant frame-to-frame velocity.
    ConstantVelocity,
    /// Gyroscope-driven rotation, filtered translation.
    Imu,
}

/// Per-frame measurement bundle handed to [`Ekf::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Measurements {
    pub dt: f64,
    pub imu: Option<ImuSample>,
}

/// Motion-prediction EKF.
///
/// The filter state is the relative motion `delta` with a 6x6 covariance
/// over its (translation, rotation) error. Pose observations arrive once
/// per tracked frame; process noise inflates the covariance between them.
pub struct Ekf {
    model: SensorModel,
    delta: SE3,
    covariance: Matrix6<f64>,
    last_pose: Option<SE3>,
    /// Latest gyro reading and interval (inertial model only).
    gyro: Vector3<f64>,
    dt: f64,
    updates: u32,
}

/// Initial covariance: essentially uninformative, so the first observed
/// motion dominates the filter state.
const P0: f64 = 1e2;
/// Per-frame process noise on the relative motion.
const Q_TRANS: f64 = 1e-3;
const Q_ROT: f64 = 1e-3;
/// Pose-observation noise.
const R_TRANS: f64 = 1e-4;
const R_ROT: f64 = 1e-4;

impl Ekf {
    pub fn new(model: SensorModel) -> Self {
        Self {
            model,
            delta: SE3::identity(),
            covariance: Matrix6::identity() * P0,
            last_pose: None,
            gyro: Vector3::zeros(),
            dt: 0.0,
            updates: 0,
        }
    }

    pub fn model(&self) -> SensorModel {
        self.model
    }

    /// The model needs two pose observations before its predictions mean
    /// anything.
    pub fn started(&self) -> bool {
        self.updates >= 2
    }

    /// Predict the next pose from the previous frame's pose.
    pub fn predict(&self, last_pose: &SE3) -> SE3 {
        let delta = match self.model {
            SensorModel::ConstantVelocity => self.delta,
            SensorModel::Imu => {
                // Gyro measures camera angular velocity in the camera frame;
                // coordinates transform with the inverse rotation.
                let rot = UnitQuaternion::from_scaled_axis(-self.gyro * self.dt);
                SE3::new(rot, self.delta.translation)
            }
        };
        delta * *last_pose
    }

    /// Ingest the optimized pose of the current frame (plus inertial data
    /// in the inertial model).
    pub fn update(&mut self, pose: &SE3, measurements: &Measurements) {
        if let Some(sample) = measurements.imu {
            self.gyro = sample.gyro;
            self.dt = measurements.dt;
        }

        let Some(last) = self.last_pose else {
            self.last_pose = Some(*pose);
            self.updates = 1;
            return;
        };

        let measured = *pose * last.inverse();

        // Innovation in the tangent space of the current estimate.
        let t_err = measured.translation - self.delta.translation;
        let r_err = (self.delta.rotation.inverse() * measured.rotation).scaled_axis();
        let innovation = Vector6::new(t_err.x, t_err.y, t_err.z, r_err.x, r_err.y, r_err.z);

        let q = process_noise();
        let r = measurement_noise();
        let p = self.covariance + q;
        let gain = p * (p + r).try_inverse().unwrap_or_else(Matrix6::identity);
        let correction = gain * innovation;

        self.delta.translation += Vector3::new(correction[0], correction[1], correction[2]);
        self.delta.rotation = self.delta.rotation
            * UnitQuaternion::from_scaled_axis(Vector3::new(
                correction[3],
                correction[4],
                correction[5],
            ));
        self.covariance = (Matrix6::identity() - gain) * p;

        self.last_pose = Some(*pose);
        self.updates += 1;
    }

    /// Reset to the cold state.
    pub fn restart(&mut self) {
        self.delta = SE3::identity();
        self.covariance = Matrix6::identity() * P0;
        self.last_pose = None;
        self.gyro = Vector3::zeros();
        self.dt = 0.0;
        self.updates = 0;
    }
}

fn process_noise() -> Matrix6<f64> {
    Matrix6::from_diagonal(&Vector6::new(Q_TRANS, Q_TRANS, Q_TRANS, Q_ROT, Q_ROT, Q_ROT))
}

fn measurement_noise() -> Matrix6<f64> {
    Matrix6::from_diagonal(&Vector6::new(R_TRANS, R_TRANS, R_TRANS, R_ROT, R_ROT, R_ROT))
}
