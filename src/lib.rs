//! Onboard attitude estimation for small flight vehicles.
//!
//! Gyro and accelerometer samples (plus an optional magnetometer) go through
//! one of three interchangeable filters and come out as a unit quaternion,
//! optionally smoothed, ready for logging and radio transmission.

pub mod error;
pub mod filters;
pub mod quaternion;
pub mod restart_manager;
pub mod sampling;
pub mod sensor_fusion;
pub mod sensors;
pub mod session;
pub mod smoothing;
pub mod telemetry;
pub mod types;

pub use error::{AttitudeError, AttitudeResult};
pub use filters::{ActiveFilter, AttitudeFilter, GyroConditioner, Observations};
pub use quaternion::Quaternion;
pub use sensor_fusion::{AttitudeEngine, EngineConfig, FilterKind};
pub use smoothing::QuaternionSmoother;
pub use types::{AttitudeEstimate, GpsFix, ImuReading, SensorSample};
