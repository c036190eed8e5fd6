use std::time::Duration;

/// Backoff bookkeeping for one periodic task.
///
/// A failed iteration is logged, the task sleeps `current_cooldown`, then
/// resumes on its next tick. Consecutive failures stretch the cooldown by
/// 1.5x up to `max_cooldown`; any success resets it.
#[derive(Clone, Debug)]
pub struct RestartState {
    pub name: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    pub current_cooldown: Duration,
    pub last_error: Option<String>,
}

pub const BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(30);

impl RestartState {
    pub fn new(name: &str, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        let max_cooldown = max_cooldown.max(base_cooldown);
        RestartState {
            name: name.to_string(),
            consecutive_failures: 0,
            total_failures: 0,
            base_cooldown,
            max_cooldown,
            current_cooldown: base_cooldown,
            last_error: None,
        }
    }

    /// Record a failed iteration and return how long the task should sleep.
    pub fn record_failure(&mut self, error: &str) -> Duration {
        if self.consecutive_failures > 0 {
            self.current_cooldown = Duration::from_secs_f64(
                (self.current_cooldown.as_secs_f64() * BACKOFF_FACTOR)
                    .min(self.max_cooldown.as_secs_f64()),
            );
        }
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());

        log::warn!(
            "[{}] iteration failed ({} in a row): {}; retrying in {:.1}s",
            self.name,
            self.consecutive_failures,
            error,
            self.current_cooldown.as_secs_f64()
        );
        self.current_cooldown
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            log::info!(
                "[{}] recovered after {} failed iteration(s)",
                self.name,
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.current_cooldown = self.base_cooldown;
    }

    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }

    pub fn status(&self) -> String {
        if !self.is_failing() {
            return format!("{}: OK ({} failures total)", self.name, self.total_failures);
        }
        format!(
            "{}: BACKING_OFF ({} in a row, next wait {:.1}s)",
            self.name,
            self.consecutive_failures,
            self.current_cooldown.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_waits_base_then_grows() {
        let mut state = RestartState::new("imu", Duration::from_millis(1000), DEFAULT_MAX_COOLDOWN);

        let first = state.record_failure("bus timeout");
        assert_eq!(first, Duration::from_millis(1000));

        let second = state.record_failure("bus timeout");
        assert!((second.as_secs_f64() - 1.5).abs() < 1e-9);

        let third = state.record_failure("bus timeout");
        assert!((third.as_secs_f64() - 2.25).abs() < 1e-9);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.last_error.as_deref(), Some("bus timeout"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut state = RestartState::new("gps", Duration::from_secs(1), Duration::from_secs(3));
        for _ in 0..20 {
            state.record_failure("no sentence");
        }
        assert_eq!(state.current_cooldown, Duration::from_secs(3));
        assert!(state.status().contains("BACKING_OFF"));
    }

    #[test]
    fn test_success_resets_cooldown() {
        let mut state = RestartState::new("imu", Duration::from_millis(200), DEFAULT_MAX_COOLDOWN);
        state.record_failure("x");
        state.record_failure("x");
        state.record_success();

        assert!(!state.is_failing());
        assert_eq!(state.current_cooldown, Duration::from_millis(200));
        assert_eq!(state.total_failures, 2);
        assert!(state.status().contains("OK"));
    }
}
