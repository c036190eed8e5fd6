/// Per-axis linear Kalman attitude filter
///
/// State per axis (2D):
/// [0]: angle (rad)
/// [1]: angular rate (rad/s)
///
/// Axes are independent: no cross-axis covariance is modelled, which holds
/// for small, weakly coupled rotations and not for aggressive manoeuvres.

use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};

use crate::error::{AttitudeError, AttitudeResult};
use crate::filters::{usable_dt, vec3_from_slice, AttitudeFilter, GyroConditioner, Observations};
use crate::quaternion::Quaternion;
use crate::types::{KalmanCovMat, KalmanGain, KalmanObservation, KalmanStateVec, Vec3};

/// Innovation covariances below this make `update` a no-op.
const MIN_INNOVATION_COVARIANCE: f64 = 1e-12;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanAxisState {
    pub angle: f64,
    pub rate: f64,
    /// Diagonal of P
    pub variance: (f64, f64),
}

#[derive(Clone, Debug)]
pub struct KalmanAxis {
    /// State vector [angle, rate]
    x: KalmanStateVec,

    /// Covariance matrix [2x2]
    p: KalmanCovMat,

    /// Transition [[1, dt], [0, 1]]
    f: KalmanCovMat,

    /// Observation row, [1, 0] for angle or [0, 1] for rate
    h: KalmanObservation,

    /// Process noise (diagonal)
    q: KalmanCovMat,

    /// Measurement noise
    r: f64,
}

impl KalmanAxis {
    /// Axis observing the angle directly (`H = [1, 0]`).
    pub fn new(
        dt: f64,
        process_noise: f64,
        measurement_noise: f64,
        initial_covariance: f64,
    ) -> AttitudeResult<Self> {
        Self::with_observation(
            dt,
            process_noise,
            measurement_noise,
            initial_covariance,
            KalmanObservation::new(1.0, 0.0),
        )
    }

    /// Axis observing the rate (`H = [0, 1]`); the angle follows through `F`.
    pub fn rate_observing(
        dt: f64,
        process_noise: f64,
        measurement_noise: f64,
        initial_covariance: f64,
    ) -> AttitudeResult<Self> {
        Self::with_observation(
            dt,
            process_noise,
            measurement_noise,
            initial_covariance,
            KalmanObservation::new(0.0, 1.0),
        )
    }

    fn with_observation(
        dt: f64,
        process_noise: f64,
        measurement_noise: f64,
        initial_covariance: f64,
        h: KalmanObservation,
    ) -> AttitudeResult<Self> {
        if !usable_dt(dt) {
            return Err(AttitudeError::InvalidConfig(format!(
                "kalman dt must be positive, got {}",
                dt
            )));
        }
        for (name, value) in [
            ("process noise", process_noise),
            ("measurement noise", measurement_noise),
            ("initial covariance", initial_covariance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AttitudeError::InvalidConfig(format!(
                    "kalman {} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        Ok(Self {
            x: KalmanStateVec::zeros(),
            p: Matrix2::identity() * initial_covariance,
            f: Matrix2::new(1.0, dt, 0.0, 1.0),
            h,
            q: Matrix2::identity() * process_noise,
            r: measurement_noise,
        })
    }

    /// x = F·x, P = F·P·Fᵗ + Q
    pub fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Scalar measurement update. Skipped when S = H·P·Hᵗ + R vanishes.
    pub fn update(&mut self, z: f64) {
        if !z.is_finite() {
            log::debug!("kalman: ignoring non-finite measurement");
            return;
        }

        let innovation = z - (self.h * self.x)[0];
        let s = (self.h * self.p * self.h.transpose())[0] + self.r;
        if !s.is_finite() || s.abs() < MIN_INNOVATION_COVARIANCE {
            log::debug!("kalman: innovation covariance {} too small, keeping prior", s);
            return;
        }

        let k: KalmanGain = self.p * self.h.transpose() / s;
        self.x += k * innovation;
        self.p = (Matrix2::identity() - k * self.h) * self.p;
    }

    pub fn angle(&self) -> f64 {
        self.x[0]
    }

    pub fn rate(&self) -> f64 {
        self.x[1]
    }

    pub fn state(&self) -> KalmanStateVec {
        self.x
    }

    pub fn covariance(&self) -> KalmanCovMat {
        self.p
    }

    pub fn get_state(&self) -> KalmanAxisState {
        KalmanAxisState {
            angle: self.x[0],
            rate: self.x[1],
            variance: (self.p[(0, 0)], self.p[(1, 1)]),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanBankState {
    pub pitch: KalmanAxisState,
    pub roll: KalmanAxisState,
    pub yaw: KalmanAxisState,
    pub quaternion: (f64, f64, f64, f64),
}

/// Pitch and roll observe accelerometer tilt; yaw observes the gyro z rate
/// because gravity carries no heading information.
///
/// The yaw axis deliberately uses `H = [0, 1]` rather than the angle-observing
/// `H = [1, 0]` of the other axes. Feeding a rate into an angle observation
/// would pull the heading toward the rate value.
pub struct KalmanBank {
    pub pitch: KalmanAxis,
    pub roll: KalmanAxis,
    pub yaw: KalmanAxis,
    conditioner: GyroConditioner,
}

impl KalmanBank {
    pub fn new(
        dt: f64,
        process_noise: f64,
        measurement_noise: f64,
        initial_covariance: f64,
        conditioner: GyroConditioner,
    ) -> AttitudeResult<Self> {
        Ok(Self {
            pitch: KalmanAxis::new(dt, process_noise, measurement_noise, initial_covariance)?,
            roll: KalmanAxis::new(dt, process_noise, measurement_noise, initial_covariance)?,
            yaw: KalmanAxis::rate_observing(dt, process_noise, measurement_noise, initial_covariance)?,
            conditioner,
        })
    }

    /// (pitch, roll) in radians from a gravity-dominated accel sample.
    pub fn tilt_from_accel(accel: &Vec3) -> Option<(f64, f64)> {
        if !accel.iter().all(|a| a.is_finite()) || accel.norm() < 1e-5 {
            return None;
        }
        let pitch = (-accel.x).atan2((accel.y * accel.y + accel.z * accel.z).sqrt());
        let roll = accel.y.atan2(accel.z);
        Some((pitch, roll))
    }

    pub fn get_state(&self) -> KalmanBankState {
        let q = self.orientation();
        KalmanBankState {
            pitch: self.pitch.get_state(),
            roll: self.roll.get_state(),
            yaw: self.yaw.get_state(),
            quaternion: (q.w, q.x, q.y, q.z),
        }
    }
}

impl AttitudeFilter for KalmanBank {
    /// Each axis carries its own fixed transition; `dt` only gates the step.
    fn predict(&mut self, dt: f64, _gyro: &Vec3) {
        if !usable_dt(dt) {
            return;
        }
        self.pitch.predict();
        self.roll.predict();
        self.yaw.predict();
    }

    fn update(&mut self, obs: &Observations) -> AttitudeResult<()> {
        obs.check_shapes()?;
        match Self::tilt_from_accel(&vec3_from_slice(obs.accel)) {
            Some((pitch, roll)) => {
                self.pitch.update(pitch);
                self.roll.update(roll);
            }
            None => log::debug!("kalman: degenerate accel, tilt axes not updated"),
        }
        let gyro = self.conditioner.apply(&vec3_from_slice(obs.gyro));
        self.yaw.update(gyro.z);
        Ok(())
    }

    fn orientation(&self) -> Quaternion {
        Quaternion::from_euler(self.roll.angle(), self.pitch.angle(), self.yaw.angle()).normalize()
    }

    fn name(&self) -> &'static str {
        "kalman"
    }
}
