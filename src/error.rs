//! # Error Handling
//!
//! Custom error type shared by every harness module.
//!
//! ## Error Categories:
//! - **Model graph errors**: a dotted module path does not resolve, or a module
//!   is not the kind an operation expects
//! - **Quantization errors**: missing calibration data, observers without
//!   statistics, invalid state combinations
//! - **Metric errors**: mismatched reference/hypothesis counts
//! - **I/O and decoding errors**: corpus files, audio decoding, model files
//!
//! Library code returns `HarnessResult<T>`; the binary entry point converts
//! everything into `anyhow::Error` with `?`.

use std::fmt;

/// Custom error types for the harness.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(HarnessError::Calibration("No calibration samples provided for static quantization.".to_string()));
/// ```
#[derive(Debug)]
pub enum HarnessError {
    /// A dotted module path was malformed (empty path or empty segment)
    InvalidModulePath(String),

    /// A module path did not resolve against the model graph
    ModuleNotFound {
        path: String,
        segment: String,
    },

    /// The addressed module cannot take part in the requested operation
    UnsupportedLayer(String),

    /// Calibration data is missing or an observer has no statistics
    Calibration(String),

    /// Quantization parameters or states are inconsistent
    Quantization(String),

    /// Metric inputs are inconsistent (e.g. reference/hypothesis counts differ)
    Metric(String),

    /// Corpus layout or audio decoding problems
    Data(String),

    /// Model files, architecture description or vocabulary problems
    Model(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Tensor computation failures reported by candle
    Tensor(candle_core::Error),

    /// File system failures
    Io(std::io::Error),

    /// Internal invariants (poisoned locks and the like)
    Internal(String),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::InvalidModulePath(path) => write!(f, "Invalid module path: '{}'", path),
            HarnessError::ModuleNotFound { path, segment } => {
                write!(f, "Module '{}' not found (failed at '{}')", path, segment)
            }
            // Calibration, quantization and metric messages are surfaced verbatim
            HarnessError::UnsupportedLayer(msg) => write!(f, "{}", msg),
            HarnessError::Calibration(msg) => write!(f, "{}", msg),
            HarnessError::Quantization(msg) => write!(f, "{}", msg),
            HarnessError::Metric(msg) => write!(f, "{}", msg),
            HarnessError::Data(msg) => write!(f, "Data error: {}", msg),
            HarnessError::Model(msg) => write!(f, "Model error: {}", msg),
            HarnessError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            HarnessError::Tensor(err) => write!(f, "Tensor error: {}", err),
            HarnessError::Io(err) => write!(f, "I/O error: {}", err),
            HarnessError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Tensor(err) => Some(err),
            HarnessError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for HarnessError {
    fn from(err: candle_core::Error) -> Self {
        HarnessError::Tensor(err)
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io(err)
    }
}

/// JSON problems come from `config.json`, `vocab.json` or report files.
impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Model(format!("JSON parsing error: {}", err))
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        HarnessError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<config::ConfigError> for HarnessError {
    fn from(err: config::ConfigError) -> Self {
        HarnessError::ConfigError(err.to_string())
    }
}

impl From<symphonia::core::errors::Error> for HarnessError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        HarnessError::Data(format!("audio decoding failed: {}", err))
    }
}

impl From<hf_hub::api::tokio::ApiError> for HarnessError {
    fn from(err: hf_hub::api::tokio::ApiError) -> Self {
        HarnessError::Model(format!("Hugging Face Hub request failed: {}", err))
    }
}

/// Type alias for Results that use the harness error type.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Turn a poisoned lock into an error instead of panicking.
pub(crate) fn lock_poisoned<T>(_: T) -> HarnessError {
    HarnessError::Internal("observer lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_verbatim_for_quantization_errors() {
        let err = HarnessError::Calibration(
            "No calibration samples provided for static quantization.".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "No calibration samples provided for static quantization."
        );
    }

    #[test]
    fn test_module_not_found_names_path_and_segment() {
        let err = HarnessError::ModuleNotFound {
            path: "encoder.enc.linear9".to_string(),
            segment: "linear9".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("encoder.enc.linear9"));
        assert!(message.contains("'linear9'"));
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HarnessError = io.into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
