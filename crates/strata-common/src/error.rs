//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Time errors
    #[error("Timestamp {t} outside valid range [{start}, {end}]")]
    TimeRange { t: i64, start: i64, end: i64 },

    #[error("Invalid interval: start {start} > end {end}")]
    InvalidInterval { start: i64, end: i64 },

    #[error("Interval too large: {size} bytes (max {max})")]
    IntervalTooLarge { size: usize, max: usize },

    // Value errors
    #[error("State value type mismatch: {0}")]
    ValueType(String),

    #[error("Attribute not found: quark {0}")]
    AttributeNotFound(i32),

    // Lifecycle errors
    #[error("State history was disposed")]
    Disposed,

    // Storage errors
    #[error("History file corrupted: {0}")]
    Corruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_time_range_display() {
        let err = StrataError::TimeRange {
            t: 2000,
            start: 0,
            end: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Timestamp 2000 outside valid range [0, 1000]"
        );
    }

    #[test]
    fn test_invalid_interval_display() {
        let err = StrataError::InvalidInterval { start: 10, end: 5 };
        assert_eq!(err.to_string(), "Invalid interval: start 10 > end 5");
    }

    #[test]
    fn test_interval_too_large_display() {
        let err = StrataError::IntervalTooLarge {
            size: 70_000,
            max: 65_535,
        };
        assert_eq!(
            err.to_string(),
            "Interval too large: 70000 bytes (max 65535)"
        );
    }

    #[test]
    fn test_corruption_display() {
        let err = StrataError::Corruption("bad node tag: 7".to_string());
        assert_eq!(err.to_string(), "History file corrupted: bad node tag: 7");
    }

    #[test]
    fn test_disposed_display() {
        assert_eq!(
            StrataError::Disposed.to_string(),
            "State history was disposed"
        );
    }

    #[test]
    fn test_attribute_not_found_display() {
        let err = StrataError::AttributeNotFound(42);
        assert_eq!(err.to_string(), "Attribute not found: quark 42");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
