//! Error types and validation functions for the Q15 analysis core.
//!
//! Only configuration problems surface as errors from the analysis entry points.
//! Problems that originate in the *data* (short windows, constant signals,
//! saturation) are absorbed by the pipeline and reported through quality flags
//! on a well-formed result. The remaining variants are used by the auxiliary
//! helpers (regression, generators, reference estimators).

use thiserror::Error;

/// Error types for the fixed-point nonlinear dynamics core.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NldError {
    /// A single configuration parameter is outside its documented range.
    #[error("Invalid parameter: {parameter} = {value}, expected {constraint}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// Parameters are individually valid but inconsistent with each other.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the inconsistency
        reason: String,
    },

    /// Insufficient data for an auxiliary computation.
    #[error("Insufficient data: need at least {required} points, got {actual}")]
    InsufficientData {
        /// Minimum required data points
        required: usize,
        /// Actual number of data points provided
        actual: usize,
    },

    /// Numerical computation error in an auxiliary helper.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for numerical failure
        reason: String,
        /// Operation that failed
        operation: Option<String>,
    },
}

impl NldError {
    /// True for the configuration classes that the analysis API rejects up front.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NldError::InvalidParameter { .. } | NldError::InvalidConfiguration { .. }
        )
    }
}

/// Result type for operations that may fail with [`NldError`].
pub type NldResult<T> = Result<T, NldError>;

/// Validates that a parameter is within expected bounds (inclusive).
///
/// # Example
/// ```rust
/// use nld_q15::errors::validate_parameter;
///
/// assert!(validate_parameter(0.7, 0.1, 0.95, "headroom").is_ok());
/// assert!(validate_parameter(1.5, 0.1, 0.95, "headroom").is_err());
/// ```
pub fn validate_parameter(value: f64, min: f64, max: f64, name: &str) -> NldResult<()> {
    if value.is_nan() {
        return Err(NldError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: "must not be NaN".to_string(),
        });
    }

    if min.is_nan() || max.is_nan() || min > max {
        return Err(NldError::InvalidConfiguration {
            reason: format!(
                "Invalid bounds for parameter {}: min={}, max={}",
                name, min, max
            ),
        });
    }

    if value < min || value > max {
        Err(NldError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: format!("[{}, {}]", min, max),
        })
    } else {
        Ok(())
    }
}

/// Validates an integer parameter against an inclusive range.
pub fn validate_range(value: usize, min: usize, max: usize, name: &str) -> NldResult<()> {
    if value < min || value > max {
        Err(NldError::InvalidParameter {
            parameter: name.to_string(),
            value: value as f64,
            constraint: format!("[{}, {}]", min, max),
        })
    } else {
        Ok(())
    }
}

/// Validates that data has sufficient length for an auxiliary computation.
pub fn validate_data_length<T>(data: &[T], min_required: usize) -> NldResult<()> {
    if data.len() < min_required {
        Err(NldError::InsufficientData {
            required: min_required,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Validates that all values in a slice are finite.
///
/// Returns on the first non-finite value, reporting its index.
pub fn validate_all_finite(data: &[f64], name: &str) -> NldResult<()> {
    if let Some((i, value)) = data.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(NldError::NumericalError {
            reason: format!("{} contains non-finite value at index {}: {}", name, i, value),
            operation: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_parameter_valid_range() {
        assert!(validate_parameter(0.5, 0.0, 1.0, "headroom").is_ok());
        assert!(validate_parameter(0.0, 0.0, 1.0, "headroom").is_ok());
        assert!(validate_parameter(1.0, 0.0, 1.0, "headroom").is_ok());
    }

    #[test]
    fn test_validate_parameter_out_of_range() {
        match validate_parameter(1.5, 0.0, 1.0, "headroom") {
            Err(NldError::InvalidParameter {
                parameter,
                value,
                constraint,
            }) => {
                assert_eq!(parameter, "headroom");
                assert_eq!(value, 1.5);
                assert_eq!(constraint, "[0, 1]");
            }
            other => panic!("Expected InvalidParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_parameter_nan_inputs() {
        assert!(matches!(
            validate_parameter(f64::NAN, 0.0, 1.0, "x"),
            Err(NldError::InvalidParameter { .. })
        ));
        assert!(matches!(
            validate_parameter(0.5, 1.0, 0.0, "x"),
            Err(NldError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(5, 2, 32, "embedding_dimension").is_ok());
        let err = validate_range(1, 2, 32, "embedding_dimension").unwrap_err();
        assert!(err.is_configuration_error());
        assert!(format!("{}", err).contains("embedding_dimension"));
    }

    #[test]
    fn test_validate_data_length_and_finite() {
        let data = vec![1.0, 2.0];
        assert!(matches!(
            validate_data_length(&data, 5),
            Err(NldError::InsufficientData {
                required: 5,
                actual: 2
            })
        ));
        assert!(validate_all_finite(&[1.0, 2.0], "ok").is_ok());
        let err = validate_all_finite(&[1.0, f64::NAN], "bad").unwrap_err();
        assert!(format!("{}", err).contains("index 1"));
        assert!(!err.is_configuration_error());
    }
}
