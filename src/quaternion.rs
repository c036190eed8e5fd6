//! Quaternion algebra shared by every attitude filter.
//!
//! Convention: components are (w, x, y, z) and a quaternion maps body-frame
//! vectors into the world frame. A body-frame delta is composed on the right:
//! `q_new = q * delta`.

use std::ops::{Add, Mul, Sub};

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::types::{RotationMatrix, Vec3};

/// Norms below this are treated as zero and never divided by.
pub const NORM_EPSILON: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}

impl Quaternion {
    pub const fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    pub fn from_array(q: [f64; 4]) -> Self {
        Self::new(q[0], q[1], q[2], q[3])
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }

    /// Narrowed copy for the radio packet.
    pub fn to_f32_array(&self) -> [f32; 4] {
        [self.w as f32, self.x as f32, self.y as f32, self.z as f32]
    }

    /// Rotation of `angle` radians about `axis`. A zero axis gives identity.
    pub fn from_axis_angle(axis: &Vec3, angle: f64) -> Self {
        let norm = axis.norm();
        if norm < NORM_EPSILON {
            return Self::identity();
        }
        let half = 0.5 * angle;
        let s = half.sin() / norm;
        Self::new(half.cos(), axis.x * s, axis.y * s, axis.z * s)
    }

    /// Delta rotation produced by body rate `omega` (rad/s) held for `dt` seconds.
    ///
    /// Falls back to identity when the rate is numerically zero.
    pub fn from_angular_rate(omega: &Vec3, dt: f64) -> Self {
        let rate = omega.norm();
        if rate < 1e-6 {
            return Self::identity();
        }
        Self::from_axis_angle(omega, rate * dt)
    }

    /// Aerospace (Z-Y-X) Euler angles in radians.
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (0.5 * roll).sin_cos();
        let (sp, cp) = (0.5 * pitch).sin_cos();
        let (sy, cy) = (0.5 * yaw).sin_cos();
        Self::new(
            cr * cp * cy + sr * sp * sy,
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
        )
    }

    /// Returns (roll, pitch, yaw) in radians.
    pub fn to_euler(&self) -> (f64, f64, f64) {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let sin_pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0);
        let pitch = sin_pitch.asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll, pitch, yaw)
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn scale(&self, k: f64) -> Self {
        Self::new(self.w * k, self.x * k, self.y * k, self.z * k)
    }

    pub fn conjugate(&self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Unit-length copy, or `None` when the norm is numerically zero.
    pub fn try_normalize(&self) -> Option<Self> {
        let norm = self.norm();
        if norm < NORM_EPSILON || !norm.is_finite() {
            return None;
        }
        Some(self.scale(1.0 / norm))
    }

    /// Unit-length copy. A degenerate quaternion is returned untouched;
    /// callers that can produce one must use [`Quaternion::try_normalize`].
    pub fn normalize(&self) -> Self {
        self.try_normalize().unwrap_or(*self)
    }

    pub fn is_unit(&self, tolerance: f64) -> bool {
        (self.norm() - 1.0).abs() <= tolerance
    }

    /// Direction cosine matrix (body to world).
    pub fn to_rotation_matrix(&self) -> RotationMatrix {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        Matrix3::new(
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - z * w),
            2.0 * (x * z + y * w),
            2.0 * (x * y + z * w),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - x * w),
            2.0 * (x * z - y * w),
            2.0 * (y * z + x * w),
            1.0 - 2.0 * (x * x + y * y),
        )
    }

    pub fn rotate(&self, v: &Vec3) -> Vec3 {
        self.to_rotation_matrix() * v
    }

    /// Rotation angle (radians) separating two orientations. `q` and `-q`
    /// describe the same rotation, so the sign is ignored.
    pub fn angle_to(&self, other: &Quaternion) -> f64 {
        let a = self.normalize();
        let b = other.normalize();
        2.0 * a.dot(&b).abs().min(1.0).acos()
    }
}

/// Hamilton product.
impl Mul for Quaternion {
    type Output = Quaternion;

    fn mul(self, rhs: Quaternion) -> Quaternion {
        let (w1, x1, y1, z1) = (self.w, self.x, self.y, self.z);
        let (w2, x2, y2, z2) = (rhs.w, rhs.x, rhs.y, rhs.z);
        Quaternion::new(
            w1 * w2 - x1 * x2 - y1 * y2 - z1 * z2,
            w1 * x2 + x1 * w2 + y1 * z2 - z1 * y2,
            w1 * y2 - x1 * z2 + y1 * w2 + z1 * x2,
            w1 * z2 + x1 * y2 - y1 * x2 + z1 * w2,
        )
    }
}

impl Add for Quaternion {
    type Output = Quaternion;

    fn add(self, rhs: Quaternion) -> Quaternion {
        Quaternion::new(self.w + rhs.w, self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Quaternion {
    type Output = Quaternion;

    fn sub(self, rhs: Quaternion) -> Quaternion {
        Quaternion::new(self.w - rhs.w, self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_quat_eq(a: Quaternion, b: Quaternion, eps: f64) {
        assert_abs_diff_eq!(a.w, b.w, epsilon = eps);
        assert_abs_diff_eq!(a.x, b.x, epsilon = eps);
        assert_abs_diff_eq!(a.y, b.y, epsilon = eps);
        assert_abs_diff_eq!(a.z, b.z, epsilon = eps);
    }

    fn sample_quats() -> (Quaternion, Quaternion, Quaternion) {
        (
            Quaternion::from_axis_angle(&Vec3::new(1.0, 0.0, 0.0), 0.7),
            Quaternion::from_axis_angle(&Vec3::new(0.0, 1.0, 0.0), -1.2),
            Quaternion::from_axis_angle(&Vec3::new(1.0, 2.0, 3.0), 2.1),
        )
    }

    #[test]
    fn test_identity_composition() {
        let (q, _, _) = sample_quats();
        assert_quat_eq(Quaternion::identity() * q, q, 1e-15);
        assert_quat_eq(q * Quaternion::identity(), q, 1e-15);
    }

    #[test]
    fn test_associative_not_commutative() {
        let (a, b, c) = sample_quats();
        assert_quat_eq((a * b) * c, a * (b * c), 1e-12);

        let ab = a * b;
        let ba = b * a;
        assert!((ab - ba).norm() > 1e-3);
    }

    #[test]
    fn test_conjugate_composes_to_identity() {
        let (_, _, q) = sample_quats();
        assert_quat_eq(q * q.conjugate(), Quaternion::identity(), 1e-12);
    }

    #[test]
    fn test_identity_leaves_vectors_unchanged() {
        let v = Vec3::new(0.3, -1.5, 2.0);
        let rotated = Quaternion::identity().rotate(&v);
        assert_abs_diff_eq!((rotated - v).norm(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_rotate_quarter_turn_about_z() {
        let q = Quaternion::from_axis_angle(&Vec3::z(), FRAC_PI_2);
        let rotated = q.rotate(&Vec3::x());
        assert_abs_diff_eq!(rotated.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rotated.y, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rotated.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_matrix_is_orthonormal() {
        let (_, _, q) = sample_quats();
        let r = q.to_rotation_matrix();
        let should_be_identity = r * r.transpose();
        assert_abs_diff_eq!((should_be_identity - Matrix3::identity()).norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_and_degenerate_guard() {
        let q = Quaternion::new(2.0, 0.0, 0.0, 0.0).normalize();
        assert_quat_eq(q, Quaternion::identity(), 1e-15);

        let zero = Quaternion::new(0.0, 0.0, 0.0, 0.0);
        assert!(zero.try_normalize().is_none());
        assert_eq!(zero.normalize(), zero);
    }

    #[test]
    fn test_angular_rate_zero_is_identity() {
        let q = Quaternion::from_angular_rate(&Vec3::zeros(), 0.01);
        assert_eq!(q, Quaternion::identity());
    }

    #[test]
    fn test_euler_round_trip_and_angle_sign() {
        let q = Quaternion::from_euler(0.1, -0.2, 0.3);
        let (roll, pitch, yaw) = q.to_euler();
        assert_abs_diff_eq!(roll, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(pitch, -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(yaw, 0.3, epsilon = 1e-12);

        // A full turn flips the sign but is the same rotation
        let full = Quaternion::from_axis_angle(&Vec3::z(), 2.0 * PI);
        assert_abs_diff_eq!(full.angle_to(&Quaternion::identity()), 0.0, epsilon = 1e-6);
    }
}
