//! Unified error handling for the iotgate data plane
//!
//! Every crate in the workspace (variable store, adapters, alarm engine)
//! reports failures through [`GatewayError`], so callers can classify and
//! surface them without knowing which component produced them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// GatewayError - Main error type
// ============================================================================

/// One failed member of a batch operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Identifier of the failed item (action ID, variable ID, ...)
    pub id: String,
    /// Rendered cause
    pub cause: String,
}

fn format_batch(total: &usize, failures: &[BatchFailure]) -> String {
    let listed: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.id, f.cause))
        .collect();
    format!(
        "Batch execution finished with {} of {} failed: [{}]",
        failures.len(),
        total,
        listed.join("; ")
    )
}

/// Main error type for the gateway data plane
#[derive(Debug, Error)]
pub enum GatewayError {
    // ======================================
    // Lookup Errors
    // ======================================
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    // ======================================
    // Connection Errors
    // ======================================
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Max reconnect attempts ({attempts}) reached")]
    MaxReconnectAttempts { attempts: u32 },

    #[error("Timeout: {0}")]
    Timeout(String),

    // ======================================
    // Protocol & Payload Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid parameter: {param}: {reason}")]
    InvalidParameter { param: String, reason: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ======================================
    // Execution Errors
    // ======================================
    #[error("Recovered from panic: {0}")]
    PanicRecovered(String),

    #[error("{}", format_batch(.total, .failures))]
    Batch {
        total: usize,
        failures: Vec<BatchFailure>,
    },

    // ======================================
    // Runtime & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using GatewayError
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Render a caught panic payload as text
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl GatewayError {
    /// Shorthand for [`GatewayError::NotFound`]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Shorthand for [`GatewayError::InvalidConfig`]
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`GatewayError::InvalidParameter`]
    pub fn invalid_parameter(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`GatewayError::ConnectionFailed`]
    pub fn connection(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        GatewayErrorTrait::is_retryable(self)
    }

    /// IDs of failed items when this is a batch report
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            Self::Batch { failures, .. } => failures.iter().map(|f| f.id.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::num::ParseIntError> for GatewayError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Validation(format!("Invalid integer: {}", err))
    }
}

impl From<std::num::ParseFloatError> for GatewayError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self::Validation(format!("Invalid float: {}", err))
    }
}

// Helper macro for protocol errors
#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::GatewayError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}

// ============================================================================
// GatewayError implements GatewayErrorTrait
// ============================================================================

impl GatewayErrorTrait for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",

            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::MaxReconnectAttempts { .. } => "MAX_RECONNECT_ATTEMPTS",
            Self::Timeout(_) => "TIMEOUT",

            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",

            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",

            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",

            Self::PanicRecovered(_) => "PANIC_RECOVERED",
            Self::Batch { .. } => "BATCH_FAILED",

            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists(_) => ErrorCategory::Conflict,

            Self::ConnectionFailed { .. }
            | Self::NotConnected(_)
            | Self::MaxReconnectAttempts { .. } => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::HttpClient(_) => ErrorCategory::Network,

            Self::Protocol { .. } | Self::UnsupportedProtocol(_) => ErrorCategory::Protocol,

            Self::Config(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,

            Self::Validation(_) | Self::InvalidParameter { .. } | Self::InvalidTransition { .. } => {
                ErrorCategory::Validation
            },

            Self::PanicRecovered(_) | Self::Batch { .. } => ErrorCategory::Execution,

            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,

            Self::Other(_) => ErrorCategory::Unknown,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            // Reconnect budget is exhausted; retrying is the supervisor's call
            Self::MaxReconnectAttempts { .. } => false,
            _ => matches!(
                self.category(),
                ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Connection
            ),
        }
    }
}

// ============================================================================
// Gateway Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Network,
    Timeout,

    // Business logic layer
    Validation,
    NotFound,
    Conflict,

    // Protocol/communication layer
    Protocol,
    Connection,

    // Action execution layer
    Execution,

    // System level
    Internal,

    // Others
    Unknown,
}

/// Gateway error capability trait
///
/// Component crates can keep their own domain-specific error types (the
/// transform engine does) and still expose the same classification surface
/// by implementing this trait.
pub trait GatewayErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and configuration tooling)
    fn error_code(&self) -> &'static str;

    /// Get error category (for classification)
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Connection
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Execution => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::not_found("var 1").error_code(), "NOT_FOUND");
        assert_eq!(
            GatewayError::UnsupportedProtocol("modbus".into()).error_code(),
            "UNSUPPORTED_PROTOCOL"
        );
        assert_eq!(
            GatewayError::PanicRecovered("boom".into()).error_code(),
            "PANIC_RECOVERED"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(GatewayError::Timeout("poll".into()).is_retryable());
        assert!(GatewayError::connection("tcp://broker", "refused").is_retryable());
        assert!(!GatewayError::MaxReconnectAttempts { attempts: 5 }.is_retryable());
        assert!(!GatewayError::Validation("bad".into()).is_retryable());
        assert!(!GatewayError::not_found("rule r1").is_retryable());
    }

    #[test]
    fn test_batch_display_lists_every_failure() {
        let err = GatewayError::Batch {
            total: 3,
            failures: vec![
                BatchFailure {
                    id: "a2".into(),
                    cause: "Validation failed: page must not be empty".into(),
                },
                BatchFailure {
                    id: "a3".into(),
                    cause: "Recovered from panic: boom".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 of 3"));
        assert!(text.contains("a2: Validation failed"));
        assert!(text.contains("a3: Recovered from panic"));
        assert_eq!(err.failed_ids(), vec!["a2", "a3"]);
    }

    #[test]
    fn test_macros() {
        let err = protocol_error!("mqtt", "bad payload");
        assert_eq!(err.to_string(), "Protocol error: mqtt: bad payload");
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }
}
