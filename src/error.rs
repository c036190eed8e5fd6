use thiserror::Error;

/// Attitude engine error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttitudeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sensor failed: {0}")]
    Sensor(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for filter and collaborator operations
pub type AttitudeResult<T> = Result<T, AttitudeError>;

/// Fail with `InvalidInput` unless `values` holds exactly `expected` elements.
pub fn check_len(what: &str, values: &[f64], expected: usize) -> AttitudeResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len_accepts_exact() {
        assert!(check_len("accel", &[0.0, 0.0, 1.0], 3).is_ok());
    }

    #[test]
    fn test_check_len_reports_shape() {
        let err = check_len("mag", &[1.0, 2.0], 3).unwrap_err();
        assert_eq!(
            err,
            AttitudeError::InvalidInput("mag must have 3 elements, got 2".to_string())
        );
        assert!(err.to_string().starts_with("Invalid input:"));
    }
}
