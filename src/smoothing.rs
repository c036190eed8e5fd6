use std::collections::VecDeque;

use crate::error::{AttitudeError, AttitudeResult};
use crate::quaternion::Quaternion;

pub const DEFAULT_WINDOW: usize = 12;

/// Moving average over the most recent filter outputs.
///
/// The result is the plain componentwise mean and is NOT renormalized;
/// callers that need a unit quaternion normalize it themselves.
#[derive(Clone, Debug)]
pub struct QuaternionSmoother {
    window: VecDeque<Quaternion>,
    window_size: usize,
}

impl QuaternionSmoother {
    pub fn new(window_size: usize) -> AttitudeResult<Self> {
        if window_size == 0 {
            return Err(AttitudeError::InvalidConfig(
                "smoothing window must hold at least one sample".to_string(),
            ));
        }
        Ok(QuaternionSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size,
        })
    }

    /// Push `q`, evict the oldest entry past the window size, return the mean.
    pub fn apply(&mut self, q: Quaternion) -> Quaternion {
        self.window.push_back(q);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let n = self.window.len() as f64;
        let sum = self
            .window
            .iter()
            .fold(Quaternion::new(0.0, 0.0, 0.0, 0.0), |acc, q| acc + *q);
        sum.scale(1.0 / n)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}
