//! Rigid-body transforms in SE(3).
//!
//! Poses throughout the crate follow the world-to-camera convention
//! (`T_cw`): applying a pose to a world point yields camera coordinates.
//! The 4x4 homogeneous matrix form is only used at the public API boundary
//! and in the trajectory dump; internally a rotation quaternion plus
//! translation vector is cheaper and never drifts off the manifold.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

/// A rigid-body transform (rotation + translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Build from a 4x4 homogeneous matrix. The upper-left 3x3 block is
    /// re-orthonormalized through the quaternion conversion.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into_owned();
        Self {
            rotation: UnitQuaternion::from_matrix(&r),
            translation: t,
        }
    }

    /// Homogeneous 4x4 matrix form.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.to_rotation_matrix().into_inner());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Inverse transform: `(R, t)^-1 = (R^T, -R^T t)`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Camera center in world coordinates for a `T_cw` pose.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Angular distance to another transform's rotation, in radians.
    pub fn angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    /// Composition: `(a * b).transform(p) == a.transform(&b.transform(p))`.
    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
