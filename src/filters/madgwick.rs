//! Gradient-descent attitude filter (Madgwick-style, accel only).
//!
//! Each update blends gyro integration with one normalized gradient step on
//! the accelerometer objective:
//!
//! ```text
//! q += dt * (1 - beta) * 0.5 * q ⊗ [0, ω] - beta * ∇f / |∇f|
//! ```
//!
//! `beta` is a per-sample step, not a rate, so it is constant per instance.

use nalgebra::{SMatrix, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{AttitudeError, AttitudeResult};
use crate::filters::{usable_dt, vec3_from_slice, AttitudeFilter, GyroConditioner, Observations};
use crate::quaternion::Quaternion;
use crate::types::Vec3;

/// Accelerometer norms below this skip the correction (free fall, glitches).
const MIN_ACCEL_NORM: f64 = 1e-5;

/// Gradients this small are numerical noise around the optimum; normalizing
/// them would turn noise into a full beta-sized step.
const MIN_GRADIENT_NORM: f64 = 1e-9;

/// The `(1 - beta)` factor on the gyro term shortens integrated rotation: at
/// this gain a full turn comes up about 0.19 rad short.
pub const DEFAULT_BETA: f64 = 0.03;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MadgwickState {
    /// Quaternion (w, x, y, z)
    pub quaternion: (f64, f64, f64, f64),
    pub beta: f64,
    pub updates: u64,
    /// Updates that ran without accelerometer correction
    pub uncorrected_updates: u64,
}

pub struct MadgwickFilter {
    q: Quaternion,
    beta: f64,
    conditioner: GyroConditioner,

    /// (dt, native gyro) latched by `AttitudeFilter::predict`
    pending: Option<(f64, Vec3)>,

    updates: u64,
    uncorrected_updates: u64,
}

impl MadgwickFilter {
    pub fn new(beta: f64, conditioner: GyroConditioner) -> AttitudeResult<Self> {
        if !(0.0..1.0).contains(&beta) {
            return Err(AttitudeError::InvalidConfig(format!(
                "beta must be in [0, 1), got {}",
                beta
            )));
        }
        Ok(Self {
            q: Quaternion::identity(),
            beta,
            conditioner,
            pending: None,
            updates: 0,
            uncorrected_updates: 0,
        })
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Fuse one gyro (native units) and accel sample over `dt` seconds.
    pub fn update(&mut self, gyro: &Vec3, accel: &Vec3, dt: f64) {
        if !usable_dt(dt) {
            log::trace!("madgwick: skipping update, dt = {}", dt);
            return;
        }

        let omega = self.conditioner.apply(gyro);
        let q = self.q;

        let gradient = match Self::normalized_accel(accel) {
            Some(a) => Self::objective_gradient(&q, &a),
            None => {
                log::debug!("madgwick: accel norm below threshold, integrating gyro only");
                self.uncorrected_updates += 1;
                Vector4::zeros()
            }
        };

        let q_dot = (q * Quaternion::new(0.0, omega.x, omega.y, omega.z)).scale(0.5);
        let rate = dt * (1.0 - self.beta);
        let step = Quaternion::new(
            rate * q_dot.w - self.beta * gradient[0],
            rate * q_dot.x - self.beta * gradient[1],
            rate * q_dot.y - self.beta * gradient[2],
            rate * q_dot.z - self.beta * gradient[3],
        );

        match (q + step).try_normalize() {
            Some(next) => self.q = next,
            None => log::warn!("madgwick: integration collapsed quaternion, keeping prior"),
        }
        self.updates += 1;
    }

    fn normalized_accel(accel: &Vec3) -> Option<Vec3> {
        let norm = accel.norm();
        if !norm.is_finite() || norm < MIN_ACCEL_NORM {
            return None;
        }
        Some(accel / norm)
    }

    /// Residual between the gravity direction implied by `q` and the measured
    /// (normalized) accel, expressed in the body frame.
    pub fn objective(q: &Quaternion, a: &Vec3) -> Vector3<f64> {
        let (qw, qx, qy, qz) = (q.w, q.x, q.y, q.z);
        Vector3::new(
            2.0 * (qx * qz - qw * qy) - a.x,
            2.0 * (qw * qx + qy * qz) - a.y,
            2.0 * (0.5 - qx * qx - qy * qy) - a.z,
        )
    }

    /// Normalized Jᵀf, or zero when the gradient vanishes.
    fn objective_gradient(q: &Quaternion, a: &Vec3) -> Vector4<f64> {
        let f = Self::objective(q, a);
        let (two_qw, two_qx, two_qy, two_qz) = (2.0 * q.w, 2.0 * q.x, 2.0 * q.y, 2.0 * q.z);

        #[rustfmt::skip]
        let jacobian = SMatrix::<f64, 3, 4>::new(
            -two_qy,         two_qz,          -two_qw, two_qx,
             two_qx,         two_qw,           two_qz, two_qy,
             0.0,    -4.0 * q.x,      -4.0 * q.y,      0.0,
        );

        let gradient = jacobian.transpose() * f;
        let norm = gradient.norm();
        if !norm.is_finite() || norm < MIN_GRADIENT_NORM {
            return Vector4::zeros();
        }
        gradient / norm
    }

    pub fn get_state(&self) -> MadgwickState {
        MadgwickState {
            quaternion: (self.q.w, self.q.x, self.q.y, self.q.z),
            beta: self.beta,
            updates: self.updates,
            uncorrected_updates: self.uncorrected_updates,
        }
    }
}

impl AttitudeFilter for MadgwickFilter {
    /// The fused step needs the accel sample, so predict only latches.
    fn predict(&mut self, dt: f64, gyro: &Vec3) {
        self.pending = Some((dt, *gyro));
    }

    fn update(&mut self, obs: &Observations) -> AttitudeResult<()> {
        obs.check_shapes()?;
        if let Some((dt, gyro)) = self.pending.take() {
            MadgwickFilter::update(self, &gyro, &vec3_from_slice(obs.accel), dt);
        }
        Ok(())
    }

    fn orientation(&self) -> Quaternion {
        self.q
    }

    fn name(&self) -> &'static str {
        "madgwick"
    }
}
