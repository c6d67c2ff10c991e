//! Error types and result handling for payload operations.
//!
//! Defines a structured error taxonomy with stable codes so that HTTP
//! clients and log consumers can tell validation failures apart. Every
//! variant describes a problem with the payload itself, so a message that
//! fails with one of these is discarded rather than retried.

use thiserror::Error;

/// Result type alias using `CourierError`.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Courier payload errors with stable codes.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Body is not a JSON payload object (E1001).
    #[error("[E1001] Invalid JSON: {message}")]
    InvalidJson {
        /// Parser error message
        message: String,
    },

    /// Endpoint missing or empty (E1002).
    #[error("[E1002] No endpoint given")]
    MissingEndpoint,

    /// Retry count outside the accepted range (E1003).
    #[error("[E1003] Retries must be between 0 and 9, got {retries}")]
    RetriesOutOfRange {
        /// The rejected retry count
        retries: i64,
    },

    /// Per-attempt timeout outside the accepted range (E1004).
    #[error("[E1004] Timeout must be between 1 and 3600 seconds, got {timeout}")]
    TimeoutOutOfRange {
        /// The rejected timeout in seconds
        timeout: u64,
    },

    /// Backoff base of zero seconds (E1005).
    #[error("[E1005] Backoff must be at least 1 second")]
    InvalidBackoff,

    /// Content flagged as base64 failed to decode (E1006).
    #[error("[E1006] Content is not valid base64: {message}")]
    InvalidContentEncoding {
        /// Decoder error message
        message: String,
    },
}

impl CourierError {
    /// Returns the error code (E1001-E1006).
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => "E1001",
            Self::MissingEndpoint => "E1002",
            Self::RetriesOutOfRange { .. } => "E1003",
            Self::TimeoutOutOfRange { .. } => "E1004",
            Self::InvalidBackoff => "E1005",
            Self::InvalidContentEncoding { .. } => "E1006",
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidJson { message: err.to_string() }
    }
}

impl From<base64::DecodeError> for CourierError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidContentEncoding { message: err.to_string() }
    }
}
