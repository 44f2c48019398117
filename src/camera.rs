//! Pinhole camera model with radial-tangential distortion.

use nalgebra::{Matrix3, Vector3};

/// Pinhole intrinsics plus distortion coefficients.
///
/// Keypoint coordinates stored in frames are undistorted; the distortion
/// model is only applied once, when a frame is built from extractor output.
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl PinholeCamera {
    /// Calibration matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        let mut k = Matrix3::identity();
        k[(0, 0)] = self.fx;
        k[(1, 1)] = self.fy;
        k[(0, 2)] = self.cx;
        k[(1, 2)] = self.cy;
        k
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.k3 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }

    /// Project a point in camera coordinates. Returns `None` behind the
    /// camera; distortion is not re-applied (projection targets the
    /// undistorted keypoint domain).
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let u = self.fx * p_cam.x / p_cam.z + self.cx;
        let v = self.fy * p_cam.y / p_cam.z + self.cy;
        Some((u, v))
    }

    /// Back-project an undistorted pixel at depth `z` into camera coordinates.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width as f64 && v >= 0.0 && v < self.height as f64
    }

    /// Undistort a pixel coordinate by fixed-point iteration on the inverse
    /// distortion model. With zero coefficients this is the identity.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }

        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }
}
