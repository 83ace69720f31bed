//! Transform Error Types

use errors::{ErrorCategory, GatewayError, GatewayErrorTrait};
use iotgate_model::DataType;
use thiserror::Error;

/// Result type for transform operations
pub type Result<T> = std::result::Result<T, TransformError>;

/// Failures while extracting or coercing a payload value
///
/// Path errors name the first segment that could not be resolved, exactly as
/// it was written in the path (`sensors[3]`, not `sensors`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Field not found: {segment}")]
    MissingField { segment: String },

    #[error("Not an object, cannot access field: {segment}")]
    NotAnObject { segment: String },

    #[error("Not an array: {segment}")]
    NotAnArray { segment: String },

    #[error("Index out of range at {segment}: {index} (length {len})")]
    IndexOutOfRange {
        segment: String,
        index: usize,
        len: usize,
    },

    #[error("Cannot convert {from} to {to}: {detail}")]
    Coercion {
        from: &'static str,
        to: DataType,
        detail: String,
    },
}

impl TransformError {
    /// Segment named by a path-walking error
    pub fn segment(&self) -> Option<&str> {
        match self {
            Self::MissingField { segment }
            | Self::NotAnObject { segment }
            | Self::NotAnArray { segment }
            | Self::IndexOutOfRange { segment, .. } => Some(segment),
            _ => None,
        }
    }
}

impl GatewayErrorTrait for TransformError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "TRANSFORM_INVALID_JSON",
            Self::InvalidPath { .. } => "TRANSFORM_INVALID_PATH",
            Self::MissingField { .. }
            | Self::NotAnObject { .. }
            | Self::NotAnArray { .. }
            | Self::IndexOutOfRange { .. } => "TRANSFORM_PATH_UNRESOLVED",
            Self::Coercion { .. } => "TRANSFORM_COERCION",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPath { .. } => ErrorCategory::Configuration,
            _ => ErrorCategory::Protocol,
        }
    }
}

impl From<TransformError> for GatewayError {
    fn from(err: TransformError) -> Self {
        GatewayError::Protocol {
            protocol: "transform".to_string(),
            message: err.to_string(),
        }
    }
}
