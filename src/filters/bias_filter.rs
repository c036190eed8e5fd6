/// Bias-compensating attitude filter
///
/// State:
/// - quaternion (w, x, y, z), body to world
/// - gyro bias (bx, by, bz) in rad/s
/// - 6x6 covariance over [attitude error (3), bias (3)]
///
/// This is a fixed-gain corrector, not an unscented filter: there are no
/// sigma points and no gain computed from an innovation covariance. The
/// covariance only grows (P += growth * P per predict) and is reported for
/// monitoring; corrections use the constant gain `K`.

use ndarray::{arr1, concatenate, s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{check_len, AttitudeError, AttitudeResult};
use crate::filters::{usable_dt, AttitudeFilter, GyroConditioner, Observations};
use crate::quaternion::Quaternion;
use crate::types::{Vec3, BIAS_STATE_DIM, RESIDUAL_DIM, VECTOR_DIM};

pub const DEFAULT_GAIN: f64 = 0.1;
pub const DEFAULT_INITIAL_COVARIANCE: f64 = 0.1;
pub const DEFAULT_COVARIANCE_GROWTH: f64 = 0.001;

const MIN_VECTOR_NORM: f64 = 1e-9;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BiasFilterState {
    /// Quaternion (w, x, y, z) representing attitude
    pub quaternion: (f64, f64, f64, f64),

    /// Gyro bias estimate [rad/s]
    pub gyro_bias: (f64, f64, f64),

    /// Covariance trace for uncertainty
    pub covariance_trace: f64,

    /// Update counters
    pub predicts: u64,
    pub updates: u64,
}

pub struct BiasFilter {
    q: Quaternion,

    /// Gyro bias [3]
    bias: Array1<f64>,

    /// Covariance matrix [6x6]
    covariance: Array2<f64>,

    /// Fixed correction gain
    gain: f64,

    /// Per-predict covariance scaling
    growth: f64,

    conditioner: GyroConditioner,

    /// World-frame reference directions
    gravity_ref: Array1<f64>,
    north_ref: Array1<f64>,

    predicts: u64,
    updates: u64,
}

impl BiasFilter {
    pub fn new(
        gain: f64,
        initial_covariance: f64,
        growth: f64,
        conditioner: GyroConditioner,
    ) -> AttitudeResult<Self> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(AttitudeError::InvalidConfig(format!(
                "bias filter gain must be non-negative, got {}",
                gain
            )));
        }
        if !initial_covariance.is_finite() || initial_covariance <= 0.0 {
            return Err(AttitudeError::InvalidConfig(format!(
                "initial covariance must be positive, got {}",
                initial_covariance
            )));
        }
        if !growth.is_finite() || growth < 0.0 {
            return Err(AttitudeError::InvalidConfig(format!(
                "covariance growth must be non-negative, got {}",
                growth
            )));
        }

        Ok(Self {
            q: Quaternion::identity(),
            bias: Array1::zeros(VECTOR_DIM),
            covariance: Array2::eye(BIAS_STATE_DIM) * initial_covariance,
            gain,
            growth,
            conditioner,
            gravity_ref: arr1(&[0.0, 0.0, 1.0]),
            north_ref: arr1(&[1.0, 0.0, 0.0]),
            predicts: 0,
            updates: 0,
        })
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    pub fn bias(&self) -> Vec3 {
        Vec3::new(self.bias[0], self.bias[1], self.bias[2])
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Propagate with a native-unit gyro sample.
    pub fn predict(&mut self, dt: f64, gyro: &Vec3) {
        if !usable_dt(dt) {
            log::trace!("bias filter: skipping predict, dt = {}", dt);
            return;
        }

        let omega = self.conditioner.apply(gyro) - self.bias();
        let delta = Quaternion::from_angular_rate(&omega, dt);
        if let Some(next) = (self.q * delta).try_normalize() {
            self.q = next;
        }

        // Simplified growth in place of F·P·Fᵗ + Q
        self.covariance = &self.covariance + &(&self.covariance * self.growth);
        self.predicts += 1;
    }

    /// Correct with accelerometer and magnetometer vectors.
    ///
    /// Both must hold exactly 3 elements. A zero-norm vector skips the
    /// correction for this call.
    pub fn update(&mut self, accel: &[f64], mag: &[f64]) -> AttitudeResult<()> {
        check_len("accelerometer", accel, VECTOR_DIM)?;
        check_len("magnetometer", mag, VECTOR_DIM)?;

        let (accel, mag) = match (Self::unit(accel), Self::unit(mag)) {
            (Some(a), Some(m)) => (a, m),
            _ => {
                log::debug!("bias filter: degenerate accel/mag norm, skipping update");
                return Ok(());
            }
        };

        let rotation = self.rotation_matrix();
        let accel_expected = rotation.dot(&self.gravity_ref);
        let mag_expected = rotation.dot(&self.north_ref);
        Self::check_shape("expected gravity", &accel_expected, VECTOR_DIM)?;
        Self::check_shape("expected reference", &mag_expected, VECTOR_DIM)?;

        let residual_accel = &accel - &accel_expected;
        let residual_mag = &mag - &mag_expected;
        let residual = concatenate(Axis(0), &[residual_accel.view(), residual_mag.view()])
            .map_err(|e| AttitudeError::InvalidInput(format!("residual assembly failed: {}", e)))?;
        Self::check_shape("residual", &residual, RESIDUAL_DIM)?;

        let correction = residual * self.gain;
        Self::check_shape("correction", &correction, RESIDUAL_DIM)?;

        // Small-angle: the first three terms nudge the vector part
        let dq = Quaternion::new(0.0, correction[0], correction[1], correction[2]);
        if let Some(next) = (self.q + dq).try_normalize() {
            self.q = next;
        }

        let bias_correction = correction.slice(s![VECTOR_DIM..RESIDUAL_DIM]);
        self.bias += &bias_correction;
        self.updates += 1;
        Ok(())
    }

    fn unit(values: &[f64]) -> Option<Array1<f64>> {
        let v = Array1::from(values.to_vec());
        let norm = v.dot(&v).sqrt();
        if !norm.is_finite() || norm < MIN_VECTOR_NORM {
            return None;
        }
        Some(v / norm)
    }

    fn rotation_matrix(&self) -> Array2<f64> {
        let r = self.q.to_rotation_matrix();
        Array2::from_shape_fn((VECTOR_DIM, VECTOR_DIM), |(i, j)| r[(i, j)])
    }

    fn check_shape(what: &str, values: &Array1<f64>, expected: usize) -> AttitudeResult<()> {
        if values.len() != expected {
            return Err(AttitudeError::InvalidInput(format!(
                "{} must have {} elements, got {}",
                what,
                expected,
                values.len()
            )));
        }
        Ok(())
    }

    pub fn get_state(&self) -> BiasFilterState {
        BiasFilterState {
            quaternion: (self.q.w, self.q.x, self.q.y, self.q.z),
            gyro_bias: (self.bias[0], self.bias[1], self.bias[2]),
            covariance_trace: self.covariance.diag().sum(),
            predicts: self.predicts,
            updates: self.updates,
        }
    }
}

impl AttitudeFilter for BiasFilter {
    fn predict(&mut self, dt: f64, gyro: &Vec3) {
        BiasFilter::predict(self, dt, gyro)
    }

    /// Without a magnetometer sample only the gyro propagation runs.
    fn update(&mut self, obs: &Observations) -> AttitudeResult<()> {
        match obs.mag {
            Some(mag) => BiasFilter::update(self, obs.accel, mag),
            None => {
                check_len("accelerometer", obs.accel, VECTOR_DIM)?;
                log::trace!("bias filter: no magnetometer sample, update skipped");
                Ok(())
            }
        }
    }

    fn orientation(&self) -> Quaternion {
        self.q
    }

    fn gyro_bias(&self) -> Option<Vec3> {
        Some(self.bias())
    }

    fn name(&self) -> &'static str {
        "bias"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn filter() -> BiasFilter {
        BiasFilter::new(
            DEFAULT_GAIN,
            DEFAULT_INITIAL_COVARIANCE,
            DEFAULT_COVARIANCE_GROWTH,
            GyroConditioner::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state() {
        let f = filter();
        assert_eq!(f.quaternion(), Quaternion::identity());
        assert_eq!(f.bias(), Vec3::zeros());
        for i in 0..BIAS_STATE_DIM {
            for j in 0..BIAS_STATE_DIM {
                let expected = if i == j { 0.1 } else { 0.0 };
                assert_abs_diff_eq!(f.covariance()[[i, j]], expected, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_short_accel_is_invalid_input() {
        let mut f = filter();
        let err = f.update(&[0.0, 1.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, AttitudeError::InvalidInput(_)));
        assert_eq!(f.get_state().updates, 0);
    }

    #[test]
    fn test_long_mag_is_invalid_input() {
        let mut f = filter();
        let err = f.update(&[0.0, 0.0, 1.0], &[1.0, 0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, AttitudeError::InvalidInput(_)));
    }

    #[test]
    fn test_well_formed_update_keeps_unit_norm() {
        let mut f = filter();
        f.predict(0.01, &Vec3::new(0.57, -1.15, 573.0));
        f.update(&[0.0, 0.0, 9.81], &[0.3, 0.4, 0.5]).unwrap();
        assert!(f.quaternion().is_unit(1e-6));
        assert!(f.bias().norm() > 0.0);
        assert_eq!(f.get_state().updates, 1);
    }

    #[test]
    fn test_aligned_measurements_change_nothing() {
        let mut f = filter();
        f.update(&[0.0, 0.0, 2.0], &[5.0, 0.0, 0.0]).unwrap();
        assert_eq!(f.quaternion(), Quaternion::identity());
        assert_eq!(f.bias(), Vec3::zeros());
    }

    #[test]
    fn test_bias_follows_reference_residual() {
        let mut f = filter();
        // mag residual = [0, 1, 0] - [1, 0, 0]
        f.update(&[0.0, 0.0, 1.0], &[0.0, 1.0, 0.0]).unwrap();
        let b = f.bias();
        assert_abs_diff_eq!(b.x, -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(b.y, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(b.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_norm_vector_skips_update() {
        let mut f = filter();
        f.update(&[0.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).unwrap();
        assert_eq!(f.get_state().updates, 0);
        assert_eq!(f.bias(), Vec3::zeros());
    }

    #[test]
    fn test_predict_integrates_bias_corrected_rate() {
        let mut f = filter();
        // 90 deg/s about z for one second
        for _ in 0..100 {
            f.predict(0.01, &Vec3::new(0.0, 0.0, 90.0));
        }
        let expected = Quaternion::from_axis_angle(&Vec3::z(), FRAC_PI_2);
        let q = f.quaternion();
        assert_abs_diff_eq!(q.w, expected.w, epsilon = 1e-9);
        assert_abs_diff_eq!(q.x, expected.x, epsilon = 1e-9);
        assert_abs_diff_eq!(q.y, expected.y, epsilon = 1e-9);
        assert_abs_diff_eq!(q.z, expected.z, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_with_zero_rate_is_identity() {
        let mut f = filter();
        f.predict(0.02, &Vec3::zeros());
        assert_eq!(f.quaternion(), Quaternion::identity());
    }

    #[test]
    fn test_covariance_grows_and_stays_positive() {
        let mut f = filter();
        let mut last_trace = f.get_state().covariance_trace;
        for _ in 0..20 {
            f.predict(0.01, &Vec3::zeros());
            let trace = f.get_state().covariance_trace;
            assert!(trace > last_trace);
            last_trace = trace;
        }
        assert_abs_diff_eq!(f.covariance()[[0, 0]], 0.1 * 1.001_f64.powi(20), epsilon = 1e-12);
        assert!((0..BIAS_STATE_DIM).all(|i| f.covariance()[[i, i]] > 0.0));
    }

    #[test]
    fn test_bad_dt_leaves_state_alone() {
        let mut f = filter();
        f.predict(0.0, &Vec3::new(0.0, 0.0, 90.0));
        f.predict(-0.5, &Vec3::new(0.0, 0.0, 90.0));
        assert_eq!(f.quaternion(), Quaternion::identity());
        assert_eq!(f.get_state().predicts, 0);
    }
}
