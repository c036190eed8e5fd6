//! Linear algebra type system for the attitude filters
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the per-axis Kalman filters and the bias-compensating filter.

use nalgebra::{Matrix3, RowVector2, SMatrix, SVector, Vector3};

// ===== State Dimensions =====
pub const KALMAN_STATE_DIM: usize = 2; // [angle, rate]
pub const BIAS_STATE_DIM: usize = 6; // [attitude error (3), gyro bias (3)]

// ===== Measurement Dimensions =====
pub const VECTOR_DIM: usize = 3; // accel, gyro, mag
pub const RESIDUAL_DIM: usize = 6; // gravity (3) + horizontal reference (3)

pub type Vec3 = Vector3<f64>;
pub type RotationMatrix = Matrix3<f64>;

// ===== Per-axis Kalman Types =====
pub type KalmanStateVec = SVector<f64, KALMAN_STATE_DIM>;
pub type KalmanCovMat = SMatrix<f64, KALMAN_STATE_DIM, KALMAN_STATE_DIM>;
pub type KalmanObservation = RowVector2<f64>; // 1×2
pub type KalmanGain = SVector<f64, KALMAN_STATE_DIM>; // 2×1
