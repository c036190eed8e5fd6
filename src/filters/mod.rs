//! Attitude filter family.
//!
//! Three interchangeable estimators sit behind [`AttitudeFilter`]. The set is
//! closed, so the runtime picks one [`ActiveFilter`] variant at startup and
//! dispatches with a `match` instead of boxing.

pub mod bias_filter;
pub mod kalman;
pub mod madgwick;

use serde::{Deserialize, Serialize};

use crate::error::{check_len, AttitudeResult};
use crate::quaternion::Quaternion;
use crate::sensor_fusion::{EngineConfig, FilterKind};
use crate::types::{SensorSample, Vec3, VECTOR_DIM};

use bias_filter::BiasFilter;
use kalman::KalmanBank;
use madgwick::MadgwickFilter;

/// Measurement vectors handed to `update`. Slices keep the length contract
/// explicit: anything that is not a 3-vector is rejected with `InvalidInput`.
#[derive(Clone, Copy, Debug)]
pub struct Observations<'a> {
    pub accel: &'a [f64],
    pub gyro: &'a [f64],
    pub mag: Option<&'a [f64]>,
}

impl<'a> Observations<'a> {
    pub fn from_sample(sample: &'a SensorSample) -> Self {
        Self {
            accel: &sample.accel,
            gyro: &sample.gyro,
            mag: sample.mag.as_ref().map(|m| m.as_slice()),
        }
    }

    pub fn check_shapes(&self) -> AttitudeResult<()> {
        check_len("accelerometer", self.accel, VECTOR_DIM)?;
        check_len("gyroscope", self.gyro, VECTOR_DIM)?;
        if let Some(mag) = self.mag {
            check_len("magnetometer", mag, VECTOR_DIM)?;
        }
        Ok(())
    }
}

/// Turns native gyro readings into rad/s.
///
/// Axes whose magnitude is under `deadband` (native units) are zeroed first,
/// then every axis is multiplied by `scale`. The default is deg/s in, rad/s
/// out, and every filter variant uses the same conversion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GyroConditioner {
    pub deadband: f64,
    pub scale: f64,
}

pub const DEFAULT_GYRO_DEADBAND: f64 = 0.015;
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

impl Default for GyroConditioner {
    fn default() -> Self {
        Self {
            deadband: DEFAULT_GYRO_DEADBAND,
            scale: DEG_TO_RAD,
        }
    }
}

impl GyroConditioner {
    pub fn new(deadband: f64, scale: f64) -> Self {
        Self { deadband, scale }
    }

    pub fn apply(&self, gyro: &Vec3) -> Vec3 {
        gyro.map(|g| if g.abs() < self.deadband { 0.0 } else { g * self.scale })
    }
}

/// `dt` that is zero, negative or not finite means "no update".
pub(crate) fn usable_dt(dt: f64) -> bool {
    dt.is_finite() && dt > 0.0
}

pub(crate) fn vec3_from_slice(values: &[f64]) -> Vec3 {
    Vec3::new(values[0], values[1], values[2])
}

/// Capability shared by every attitude filter.
pub trait AttitudeFilter {
    /// Propagate with a native-unit gyro sample held for `dt` seconds.
    fn predict(&mut self, dt: f64, gyro: &Vec3);

    /// Correct with the measurement vectors.
    fn update(&mut self, obs: &Observations) -> AttitudeResult<()>;

    /// Current orientation, unit norm.
    fn orientation(&self) -> Quaternion;

    /// Estimated gyro bias (rad/s) for variants that track one.
    fn gyro_bias(&self) -> Option<Vec3> {
        None
    }

    fn name(&self) -> &'static str;

    /// Shape-check, then predict and update. Nothing is mutated when the
    /// observations are malformed or `dt` is not usable.
    fn step(&mut self, dt: f64, obs: &Observations) -> AttitudeResult<()> {
        obs.check_shapes()?;
        if !usable_dt(dt) {
            return Ok(());
        }
        self.predict(dt, &vec3_from_slice(obs.gyro));
        self.update(obs)
    }
}

pub enum ActiveFilter {
    GradientDescent(MadgwickFilter),
    KalmanBank(KalmanBank),
    BiasCompensating(BiasFilter),
}

impl ActiveFilter {
    pub fn from_config(config: &EngineConfig) -> AttitudeResult<Self> {
        let conditioner = config.gyro_conditioner();
        let filter = match config.filter {
            FilterKind::Madgwick => {
                ActiveFilter::GradientDescent(MadgwickFilter::new(config.beta, conditioner)?)
            }
            FilterKind::Kalman => ActiveFilter::KalmanBank(KalmanBank::new(
                config.kalman_dt,
                config.kalman_process_noise,
                config.kalman_measurement_noise,
                config.kalman_initial_covariance,
                conditioner,
            )?),
            FilterKind::Bias => ActiveFilter::BiasCompensating(BiasFilter::new(
                config.bias_gain,
                config.covariance_initial,
                config.covariance_growth,
                conditioner,
            )?),
        };
        log::info!("Attitude filter selected: {}", filter.name());
        Ok(filter)
    }

    fn inner(&self) -> &dyn AttitudeFilter {
        match self {
            ActiveFilter::GradientDescent(f) => f,
            ActiveFilter::KalmanBank(f) => f,
            ActiveFilter::BiasCompensating(f) => f,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AttitudeFilter {
        match self {
            ActiveFilter::GradientDescent(f) => f,
            ActiveFilter::KalmanBank(f) => f,
            ActiveFilter::BiasCompensating(f) => f,
        }
    }
}

impl AttitudeFilter for ActiveFilter {
    fn predict(&mut self, dt: f64, gyro: &Vec3) {
        self.inner_mut().predict(dt, gyro)
    }

    fn update(&mut self, obs: &Observations) -> AttitudeResult<()> {
        self.inner_mut().update(obs)
    }

    fn orientation(&self) -> Quaternion {
        self.inner().orientation()
    }

    fn gyro_bias(&self) -> Option<Vec3> {
        self.inner().gyro_bias()
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}
