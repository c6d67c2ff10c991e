//! Error types for broker operations.
//!
//! Broker failures carry the operation and target that failed so log lines
//! point at the exact exchange or queue. Messages are stored as strings to
//! keep the error `Clone` across task boundaries.

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised while talking to the message broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Establishing the connection failed.
    #[error("broker connection failed: {message}")]
    ConnectionFailed {
        /// Transport error message
        message: String,
    },

    /// Handle used before `connect` succeeded.
    #[error("broker handle is not connected")]
    NotConnected,

    /// Opening a channel failed.
    #[error("channel creation failed: {message}")]
    ChannelFailed {
        /// Broker error message
        message: String,
    },

    /// A topology or messaging command was refused.
    #[error("{operation} on '{target}' failed: {message}")]
    OperationFailed {
        /// Command name, e.g. `queue_declare`
        operation: &'static str,
        /// Exchange or queue the command addressed
        target: String,
        /// Broker error message
        message: String,
    },

    /// Settling a delivery failed.
    #[error("acknowledgement failed: {message}")]
    AcknowledgementFailed {
        /// Broker error message
        message: String,
    },

    /// Delay cannot be expressed by the 28-bit ladder.
    #[error("delay of {delay_seconds}s exceeds ladder maximum of {max_seconds}s")]
    DelayOutOfRange {
        /// Requested delay
        delay_seconds: u64,
        /// Largest encodable delay
        max_seconds: u64,
    },

    /// Routing key does not follow the ladder format.
    #[error("malformed ladder routing key '{key}': {reason}")]
    MalformedRoutingKey {
        /// Offending key
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// Queue name cannot be used as a routing-key segment.
    #[error("invalid queue name '{name}': {reason}")]
    InvalidQueueName {
        /// Offending name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// Header value could not be read as an integer.
    #[error("header '{header}' is not an integer: {found}")]
    InvalidHeader {
        /// Header name
        header: String,
        /// Description of the value found
        found: String,
    },
}

impl BrokerError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: message.into() }
    }

    /// Creates a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelFailed { message: message.into() }
    }

    /// Creates an operation error for `operation` against `target`.
    pub fn operation(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed { operation, target: target.into(), message: message.into() }
    }

    /// Creates an acknowledgement error.
    pub fn acknowledgement(message: impl Into<String>) -> Self {
        Self::AcknowledgementFailed { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_names_target() {
        let error = BrokerError::operation("queue_declare", "orders", "PRECONDITION_FAILED");
        assert_eq!(error.to_string(), "queue_declare on 'orders' failed: PRECONDITION_FAILED");
    }

    #[test]
    fn delay_out_of_range_names_limit() {
        let error =
            BrokerError::DelayOutOfRange { delay_seconds: 1 << 28, max_seconds: (1 << 28) - 1 };
        assert!(error.to_string().contains("268435455"), "{error}");
    }
}
