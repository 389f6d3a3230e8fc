//! Error types for settings validation, the recording state machine and
//! retention policies

use thiserror::Error;

/// Errors raised while validating a camera setting update
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    /// The field name is not a known camera setting
    #[error("Unknown camera setting '{0}'")]
    UnknownField(String),

    /// Numeric value outside of the allowed range
    #[error("Value {value} for '{field}' is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Value is not one of the allowed choices
    #[error("Value '{value}' for '{field}' is not one of {allowed:?}")]
    InvalidChoice {
        field: &'static str,
        value: String,
        allowed: Vec<String>,
    },

    /// Value has the wrong JSON type for the field
    #[error("Value {value} for '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Misuse of the recording state machine. The state is left unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingError {
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not currently recording")]
    NotRecording,
}

/// Invalid retention policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetentionError {
    #[error("Retention of {value} {unit} is outside 1..={max}")]
    OutOfRange {
        value: u32,
        unit: &'static str,
        max: u32,
    },

    #[error("Unknown retention unit '{0}', expected days or months")]
    UnknownUnit(String),
}
