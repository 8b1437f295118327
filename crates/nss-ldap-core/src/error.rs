//! Error types for directory lookups.
//!
//! Every failure inside the engine is an [`Error`]. At the name-service boundary each error
//! collapses into one of the five [`Status`] values via [`Error::status`].

use crate::status::{status_for_result_code, Status};
use thiserror::Error;

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The query ran but produced no matching or parseable entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// No directory server could be reached within the retry budget
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// A protocol exchange exceeded its deadline
    #[error("Timeout waiting for directory: {0}")]
    Timeout(String),

    /// The caller-supplied buffer cannot hold the record
    #[error("Buffer too small: requested {requested} bytes, {remaining} remaining")]
    BufferTooSmall {
        /// Bytes the failed allocation needed, including alignment padding
        requested: usize,
        /// Bytes left in the arena when the allocation was attempted
        remaining: usize,
    },

    /// The directory answered with a non-success result code
    #[error("Directory error {code}: {message}")]
    Directory {
        /// Protocol result code
        code: u32,
        /// Diagnostic text returned by the server
        message: String,
    },

    /// The protocol library or transport failed
    #[error("External service error: {service}: {message}")]
    ExternalServiceError {
        /// Component that failed
        service: String,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The request could not be turned into a query
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Enumeration stopped with no further data
    #[error("End of enumeration")]
    EndOfEnumeration,

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the name-service status this error is reported as.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::NotFound(_) | Self::InvalidRequest(_) => Status::NotFound,
            Self::BufferTooSmall { .. } => Status::TryAgain,
            Self::Directory { code, .. } => status_for_result_code(*code),
            Self::EndOfEnumeration => Status::Return,
            Self::Unavailable(_)
            | Self::Timeout(_)
            | Self::ExternalServiceError { .. }
            | Self::ConfigError(_)
            | Self::ValidationError(_)
            | Self::InternalError(_) => Status::Unavailable,
        }
    }

    /// Returns true when the reconnect controller should try another endpoint.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self.status(), Status::Unavailable)
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::BufferTooSmall { .. } => "BUFFER_TOO_SMALL",
            Self::Directory { .. } => "DIRECTORY_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::EndOfEnumeration => "END_OF_ENUMERATION",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error should be logged for operators.
    ///
    /// Buffer sizing failures are expected and handled by the caller, so they stay quiet.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        !matches!(
            self,
            Self::BufferTooSmall { .. } | Self::NotFound(_) | Self::EndOfEnumeration
        )
    }

    /// Convenience constructor for a buffer overflow.
    #[must_use]
    pub const fn buffer_too_small(requested: usize, remaining: usize) -> Self {
        Self::BufferTooSmall {
            requested,
            remaining,
        }
    }
}

// Conversions from external error types
impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid directory URI: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::ExternalServiceError {
            service: "io".to_string(),
            message: err.to_string(),
        }
    }
}
