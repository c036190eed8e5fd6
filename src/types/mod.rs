pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// One calibrated IMU read as delivered by the acquisition side.
///
/// `accel` is in g (before `accel_scale`), `gyro` in the sensor's native
/// rate unit (deg/s for the default conditioner).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    pub accel: [f64; 3],
    pub gyro: [f64; 3],
    pub mag: Option<[f64; 3]>,
    pub temperature: f64,
    pub pressure_hpa: f64,
}

/// Input to one filter step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Seconds since the session started
    pub timestamp: f64,
    pub accel: [f64; 3],
    pub gyro: [f64; 3],
    pub mag: Option<[f64; 3]>,
    /// Seconds since the previous sample, must be > 0 to move the filter
    pub dt: f64,
}

impl SensorSample {
    pub fn from_reading(reading: &ImuReading, timestamp: f64, dt: f64) -> Self {
        Self {
            timestamp,
            accel: reading.accel,
            gyro: reading.gyro,
            mag: reading.mag,
            dt,
        }
    }
}

/// Most recent GPS fix, overwritten wholesale by the GPS task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub satellites: i32,
    pub valid: bool,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            satellites: 0,
            valid: false,
        }
    }
}

impl GpsFix {
    pub fn status(&self) -> &'static str {
        if self.valid {
            "valid"
        } else {
            "invalid"
        }
    }
}

/// What the engine hands to logging and transport after one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttitudeEstimate {
    pub timestamp: f64,
    /// Raw filter output, unit norm
    pub orientation: crate::quaternion::Quaternion,
    /// Moving-average output (not renormalized); equals `orientation`
    /// when smoothing is disabled
    pub smoothed: crate::quaternion::Quaternion,
    /// rad/s, bias-compensating variant only
    pub gyro_bias: Option<[f64; 3]>,
    pub filter: String,
}
