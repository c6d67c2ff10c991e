//! Error types for HTTP replay and retry operations.
//!
//! Defines the failures a consumer can hit while replaying a message:
//! transport and HTTP status failures from the destination, payload
//! problems that make a message unprocessable, and broker failures while
//! settling or republishing.

use courier_broker::BrokerError;
use courier_core::CourierError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for HTTP replay operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response was neither 2xx, 4xx nor 5xx.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// Message body is not a usable payload.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Validation error message, including its code
        message: String,
    },

    /// Broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Invalid pool or client configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// A worker's delivery stream ended.
    #[error("delivery stream for worker {worker_id} closed")]
    StreamClosed {
        /// Worker whose stream closed
        worker_id: usize,
    },

    /// A worker task panicked.
    #[error("worker panicked: {error}")]
    WorkerPanic {
        /// Panic description from the join error
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates the error matching a non-2xx HTTP status.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        match status_code {
            400..=499 => Self::ClientError { status_code, body: body.into() },
            500..=599 => Self::ServerError { status_code, body: body.into() },
            _ => Self::UnexpectedStatus { status_code },
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }
}

impl From<CourierError> for DeliveryError {
    fn from(error: CourierError) -> Self {
        Self::InvalidPayload { message: error.to_string() }
    }
}
