// sensor_fusion.rs - Pure computation layer for the attitude engine
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - sensor buses, GPS UART, radio
//   - CSV logging and session files
//
// It takes sensor samples in and produces attitude estimates out, so it can be
// unit-tested with synthetic data and replayed from recorded sessions without
// touching the sampling loop.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{AttitudeError, AttitudeResult};
use crate::filters::{ActiveFilter, AttitudeFilter, GyroConditioner, Observations, DEG_TO_RAD};
use crate::smoothing::QuaternionSmoother;
use crate::types::{AttitudeEstimate, SensorSample, Vec3};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Gradient-descent (Madgwick-style) filter
    Madgwick,
    /// Per-axis linear Kalman bank
    Kalman,
    /// Fixed-gain bias-compensating filter
    Bias,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub filter: FilterKind,

    // ── Gradient descent ──
    pub beta: f64,

    // ── Bias-compensating filter ──
    pub bias_gain: f64,
    pub covariance_initial: f64,
    pub covariance_growth: f64,

    // ── Kalman bank ──
    pub kalman_process_noise: f64,
    pub kalman_measurement_noise: f64,
    pub kalman_initial_covariance: f64,
    pub kalman_dt: f64,

    // ── Smoothing ──
    pub smoothing_window: usize,
    pub smoothing_enabled: bool,

    // ── Sensor conditioning ──
    /// Native gyro units
    pub gyro_deadband: f64,
    /// Native gyro units to rad/s
    pub gyro_scale: f64,
    pub accel_scale: f64,
    /// Static gyro offset in native units, subtracted before filtering
    pub gyro_offset: [f64; 3],

    // ── Task cadence ──
    pub sample_period_ms: u64,
    pub gps_period_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filter: FilterKind::Madgwick,
            beta: 0.03,
            bias_gain: 0.1,
            covariance_initial: 0.1,
            covariance_growth: 0.001,
            kalman_process_noise: 0.01,
            kalman_measurement_noise: 1.0,
            kalman_initial_covariance: 1.0,
            kalman_dt: 0.01,
            smoothing_window: 12,
            smoothing_enabled: true,
            gyro_deadband: 0.015,
            gyro_scale: DEG_TO_RAD,
            accel_scale: 1.0,
            gyro_offset: [0.0; 3],
            sample_period_ms: 50,
            gps_period_ms: 100,
            error_backoff_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> AttitudeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AttitudeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&text).map_err(|e| {
            AttitudeError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AttitudeResult<()> {
        fn fail(msg: String) -> AttitudeResult<()> {
            Err(AttitudeError::InvalidConfig(msg))
        }

        if !(0.0..1.0).contains(&self.beta) {
            return fail(format!("beta must be in [0, 1), got {}", self.beta));
        }
        for (name, value) in [
            ("bias_gain", self.bias_gain),
            ("covariance_growth", self.covariance_growth),
            ("kalman_process_noise", self.kalman_process_noise),
            ("kalman_measurement_noise", self.kalman_measurement_noise),
            ("kalman_initial_covariance", self.kalman_initial_covariance),
            ("gyro_deadband", self.gyro_deadband),
        ] {
            if !value.is_finite() || value < 0.0 {
                return fail(format!("{} must be non-negative, got {}", name, value));
            }
        }
        for (name, value) in [
            ("covariance_initial", self.covariance_initial),
            ("kalman_dt", self.kalman_dt),
            ("gyro_scale", self.gyro_scale),
            ("accel_scale", self.accel_scale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return fail(format!("{} must be positive, got {}", name, value));
            }
        }
        if self.gyro_offset.iter().any(|o| !o.is_finite()) {
            return fail("gyro_offset must be finite".to_string());
        }
        if self.smoothing_window == 0 {
            return fail("smoothing_window must be at least 1".to_string());
        }
        if self.sample_period_ms == 0 || self.gps_period_ms == 0 {
            return fail("task periods must be at least 1 ms".to_string());
        }
        Ok(())
    }

    pub fn gyro_conditioner(&self) -> GyroConditioner {
        GyroConditioner::new(self.gyro_deadband, self.gyro_scale)
    }
}

// ─── Engine snapshot ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineState {
    pub filter: String,
    pub samples_processed: u64,
    pub samples_rejected: u64,
    pub gyro_offset: [f64; 3],
    pub orientation: (f64, f64, f64, f64),
}

// ─── The engine ──────────────────────────────────────────────────────────────

/// sample → conditioning → active filter → smoother → estimate
pub struct AttitudeEngine {
    config: EngineConfig,
    filter: ActiveFilter,
    smoother: Option<QuaternionSmoother>,
    gyro_offset: Vec3,
    samples_processed: u64,
    samples_rejected: u64,
}

impl AttitudeEngine {
    pub fn new(config: EngineConfig) -> AttitudeResult<Self> {
        config.validate()?;
        let filter = ActiveFilter::from_config(&config)?;
        let smoother = if config.smoothing_enabled {
            Some(QuaternionSmoother::new(config.smoothing_window)?)
        } else {
            None
        };
        let gyro_offset = Vec3::from(config.gyro_offset);

        Ok(Self {
            config,
            filter,
            smoother,
            gyro_offset,
            samples_processed: 0,
            samples_rejected: 0,
        })
    }

    /// Run one sample through the active filter.
    ///
    /// Errors leave the filter and smoother exactly as they were.
    pub fn process(&mut self, sample: &SensorSample) -> AttitudeResult<AttitudeEstimate> {
        let accel = sample.accel.map(|a| a * self.config.accel_scale);
        let gyro = [
            sample.gyro[0] - self.gyro_offset.x,
            sample.gyro[1] - self.gyro_offset.y,
            sample.gyro[2] - self.gyro_offset.z,
        ];
        let obs = Observations {
            accel: &accel,
            gyro: &gyro,
            mag: sample.mag.as_ref().map(|m| &m[..]),
        };

        if let Err(e) = self.filter.step(sample.dt, &obs) {
            self.samples_rejected += 1;
            return Err(e);
        }
        self.samples_processed += 1;

        let orientation = self.filter.orientation();
        let smoothed = match self.smoother.as_mut() {
            Some(smoother) => smoother.apply(orientation),
            None => orientation,
        };

        Ok(AttitudeEstimate {
            timestamp: sample.timestamp,
            orientation,
            smoothed,
            gyro_bias: self.filter.gyro_bias().map(|b| [b.x, b.y, b.z]),
            filter: self.filter.name().to_string(),
        })
    }

    /// Average the gyro over a stationary window and use it as the static
    /// offset from now on. Returns the offset in native units.
    pub fn calibrate_gyro(&mut self, stationary: &[SensorSample]) -> Vec3 {
        if stationary.is_empty() {
            log::warn!("Gyro calibration skipped: no stationary samples");
            return self.gyro_offset;
        }
        let sum = stationary
            .iter()
            .fold(Vec3::zeros(), |acc, s| acc + Vec3::from(s.gyro));
        self.gyro_offset = sum / stationary.len() as f64;
        log::info!(
            "Gyro offset calibrated from {} samples: ({:.4}, {:.4}, {:.4})",
            stationary.len(),
            self.gyro_offset.x,
            self.gyro_offset.y,
            self.gyro_offset.z
        );
        self.gyro_offset
    }

    pub fn filter(&self) -> &ActiveFilter {
        &self.filter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get_state(&self) -> EngineState {
        let q = self.filter.orientation();
        EngineState {
            filter: self.filter.name().to_string(),
            samples_processed: self.samples_processed,
            samples_rejected: self.samples_rejected,
            gyro_offset: [self.gyro_offset.x, self.gyro_offset.y, self.gyro_offset.z],
            orientation: (q.w, q.x, q.y, q.z),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quaternion::Quaternion;
    use approx::assert_abs_diff_eq;

    fn sample(gyro: [f64; 3], accel: [f64; 3], mag: Option<[f64; 3]>, dt: f64) -> SensorSample {
        SensorSample { timestamp: 0.0, accel, gyro, mag, dt }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let bad = [
            EngineConfig { beta: 1.5, ..EngineConfig::default() },
            EngineConfig { bias_gain: -0.1, ..EngineConfig::default() },
            EngineConfig { covariance_initial: 0.0, ..EngineConfig::default() },
            EngineConfig { smoothing_window: 0, ..EngineConfig::default() },
            EngineConfig { kalman_dt: f64::NAN, ..EngineConfig::default() },
            EngineConfig { sample_period_ms: 0, ..EngineConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(AttitudeError::InvalidConfig(_))));
            assert!(AttitudeEngine::new(config).is_err());
        }
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"filter": "bias", "bias_gain": 0.2}"#).unwrap();
        assert_eq!(config.filter, FilterKind::Bias);
        assert_abs_diff_eq!(config.bias_gain, 0.2);
        assert_eq!(config.smoothing_window, 12);
        assert_abs_diff_eq!(config.gyro_scale, DEG_TO_RAD);
    }

    #[test]
    fn test_load_from_file_reports_missing_file() {
        let path = std::env::temp_dir().join("flight_attitude_missing_config.json");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            EngineConfig::load_from_file(&path),
            Err(AttitudeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_at_rest_end_to_end() {
        let mut engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let mut last = None;
        for _ in 0..100 {
            last = Some(engine.process(&sample([0.0; 3], [0.0, 0.0, 1.0], None, 0.01)).unwrap());
        }
        let estimate = last.unwrap();
        assert_abs_diff_eq!(estimate.orientation.w, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(estimate.orientation.x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(estimate.orientation.y, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(estimate.orientation.z, 0.0, epsilon = 1e-6);
        assert_eq!(estimate.filter, "madgwick");
        assert!(estimate.gyro_bias.is_none());
    }

    #[test]
    fn test_full_revolution_end_to_end() {
        let config = EngineConfig { beta: 0.001, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        for _ in 0..360 {
            let est = engine
                .process(&sample([0.0, 0.0, 360.0], [0.0, 0.0, 1.0], None, 1.0 / 360.0))
                .unwrap();
            assert!(est.orientation.is_unit(1e-6));
        }
        let q = engine.filter().orientation();
        assert!(q.angle_to(&Quaternion::identity()) < 0.01);
    }

    #[test]
    fn test_accel_scale_is_applied() {
        // m/s² input scaled to g; the filter only sees the direction, so a
        // tiny scale that would trip the free-fall guard proves it is applied
        let config = EngineConfig { accel_scale: 1e-7, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        let est = engine.process(&sample([0.0; 3], [0.0, 9.81, 0.0], None, 0.01)).unwrap();
        assert_eq!(est.orientation, Quaternion::identity());
    }

    #[test]
    fn test_gyro_offset_cancels_constant_rate() {
        let config = EngineConfig { gyro_offset: [0.0, 0.0, 5.0], ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        for _ in 0..50 {
            engine.process(&sample([0.0, 0.0, 5.0], [0.0, 0.0, 1.0], None, 0.02)).unwrap();
        }
        assert_eq!(engine.filter().orientation(), Quaternion::identity());
    }

    #[test]
    fn test_calibrate_gyro_uses_mean() {
        let mut engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let stationary: Vec<SensorSample> = (0..10)
            .map(|i| sample([1.0, -2.0, 0.5 + i as f64 * 0.1], [0.0, 0.0, 1.0], None, 0.01))
            .collect();
        let offset = engine.calibrate_gyro(&stationary);
        assert_abs_diff_eq!(offset.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(offset.y, -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(offset.z, 0.95, epsilon = 1e-12);
        assert_eq!(engine.get_state().gyro_offset, [offset.x, offset.y, offset.z]);
    }

    #[test]
    fn test_smoothing_disabled_passes_orientation_through() {
        let config = EngineConfig { smoothing_enabled: false, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        let est = engine.process(&sample([0.0, 0.0, 90.0], [0.0, 0.0, 1.0], None, 0.1)).unwrap();
        assert_eq!(est.smoothed, est.orientation);
    }

    #[test]
    fn test_smoothed_output_lags_raw() {
        let mut engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let mut est = None;
        for _ in 0..5 {
            est = Some(engine.process(&sample([0.0, 0.0, 90.0], [0.0, 0.0, 1.0], None, 0.1)).unwrap());
        }
        let est = est.unwrap();
        assert!(est.smoothed.z < est.orientation.z);
        assert!(est.smoothed.z > 0.0);
    }

    #[test]
    fn test_bias_variant_reports_bias_and_runs_without_mag() {
        let config = EngineConfig { filter: FilterKind::Bias, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();

        let est = engine.process(&sample([0.0, 0.0, 90.0], [0.0, 0.0, 1.0], None, 0.1)).unwrap();
        assert_eq!(est.gyro_bias, Some([0.0, 0.0, 0.0]));
        assert!(est.orientation.z > 0.0);

        let est = engine
            .process(&sample([0.0; 3], [0.0, 0.0, 1.0], Some([0.0, 1.0, 0.0]), 0.1))
            .unwrap();
        assert!(est.gyro_bias.is_some());
        assert!(est.orientation.is_unit(1e-9));
    }

    #[test]
    fn test_kalman_variant_through_engine() {
        let config = EngineConfig { filter: FilterKind::Kalman, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        let est = engine.process(&sample([0.0; 3], [0.0, 0.0, 1.0], None, 0.01)).unwrap();
        assert_eq!(est.filter, "kalman");
        assert!(est.orientation.is_unit(1e-9));
        assert_eq!(engine.get_state().samples_processed, 1);
    }

    #[test]
    fn test_unusable_dt_leaves_bias_variant_untouched() {
        let config = EngineConfig { filter: FilterKind::Bias, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        for dt in [0.0, -0.05] {
            let est = engine
                .process(&sample([0.0, 0.0, 90.0], [0.0, 0.3, 1.0], Some([0.0, 1.0, 0.0]), dt))
                .unwrap();
            assert_eq!(est.orientation, Quaternion::identity());
            assert_eq!(est.gyro_bias, Some([0.0, 0.0, 0.0]));
        }
    }

    #[test]
    fn test_unusable_dt_leaves_kalman_variant_untouched() {
        let config = EngineConfig { filter: FilterKind::Kalman, ..EngineConfig::default() };
        let mut engine = AttitudeEngine::new(config).unwrap();
        for dt in [0.0, -0.01] {
            let est = engine
                .process(&sample([5.0, 0.0, 30.0], [0.0, 0.5, 0.8], None, dt))
                .unwrap();
            assert_eq!(est.orientation, Quaternion::identity());
        }
    }
}
