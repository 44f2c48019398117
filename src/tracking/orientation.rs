//! Madgwick orientation filter.
//!
//! Gradient-descent complementary filter fusing gyroscope integration with
//! an accelerometer gravity reference. Used in the inertial tracking mode
//! to detect aggressive rotation and to substitute the rotational block of
//! the motion-model prediction.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::geometry::SE3;

pub struct Madgwick {
    q: Quaternion<f64>,
    /// Filter gain (beta): weight of the accelerometer correction step.
    gain: f64,
}

impl Madgwick {
    pub fn new(gain: f64) -> Self {
        Self {
            q: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            gain,
        }
    }

    /// Current absolute orientation estimate.
    pub fn local_orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(self.q)
    }

    /// Re-seed the filter from an externally estimated pose, keeping the
    /// filter consistent with the visual estimate between updates.
    pub fn set_orientation_from_pose(&mut self, pose: &SE3) {
        self.q = *pose.rotation.quaternion();
    }

    /// Advance the filter by one IMU sample over `dt` seconds.
    ///
    /// A zero-norm accelerometer reading skips the gravity correction and
    /// degrades to pure gyro integration.
    pub fn update(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        if dt <= 0.0 {
            return;
        }

        let c = self.q.coords;
        let (q0, q1, q2, q3) = (c.w, c.x, c.y, c.z);
        let (gx, gy, gz) = (gyro.x, gyro.y, gyro.z);

        // Rate of change from gyroscope: q_dot = 0.5 * q ⊗ (0, ω).
        let mut qd0 = 0.5 * (-q1 * gx - q2 * gy - q3 * gz);
        let mut qd1 = 0.5 * (q0 * gx + q2 * gz - q3 * gy);
        let mut qd2 = 0.5 * (q0 * gy - q1 * gz + q3 * gx);
        let mut qd3 = 0.5 * (q0 * gz + q1 * gy - q2 * gx);

        let norm = accel.norm();
        if norm > 1e-9 {
            let a = accel / norm;

            // Objective-function gradient for the gravity direction,
            // J^T * f in closed form.
            let f0 = 2.0 * (q1 * q3 - q0 * q2) - a.x;
            let f1 = 2.0 * (q0 * q1 + q2 * q3) - a.y;
            let f2 = 2.0 * (0.5 - q1 * q1 - q2 * q2) - a.z;

            let mut s0 = -2.0 * q2 * f0 + 2.0 * q1 * f1;
            let mut s1 = 2.0 * q3 * f0 + 2.0 * q0 * f1 - 4.0 * q1 * f2;
            let mut s2 = -2.0 * q0 * f0 + 2.0 * q3 * f1 - 4.0 * q2 * f2;
            let mut s3 = 2.0 * q1 * f0 + 2.0 * q2 * f1;

            let s_norm = (s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3).sqrt();
            if s_norm > 1e-12 {
                s0 /= s_norm;
                s1 /= s_norm;
                s2 /= s_norm;
                s3 /= s_norm;
                qd0 -= self.gain * s0;
                qd1 -= self.gain * s1;
                qd2 -= self.gain * s2;
                qd3 -= self.gain * s3;
            }
        }

        let w = q0 + qd0 * dt;
        let x = q1 + qd1 * dt;
        let y = q2 + qd2 * dt;
        let z = q3 + qd3 * dt;
        let n = (w * w + x * x + y * y + z * z).sqrt();
        if n > 1e-12 {
            self.q = Quaternion::new(w / n, x / n, y / n, z / n);
        }
    }
}
