//! HTTP error responses.
//!
//! Every failure leaves the front door as `{"error": <reason>, "message":
//! <detail>}`, where `error` is the canonical reason phrase of the status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_broker::BrokerError;
use courier_core::CourierError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::management::ManagementError;

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Canonical reason phrase of the status code.
    pub error: String,
    /// What went wrong.
    pub message: String,
}

/// Failures a handler reports to the client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body was rejected.
    #[error("{0}")]
    BadRequest(String),

    /// The broker or server failed.
    #[error("{0}")]
    Internal(String),

    /// An upstream API failed.
    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    /// Status code sent for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CourierError> for ApiError {
    fn from(err: CourierError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InvalidQueueName { .. } => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<ManagementError> for ApiError {
    fn from(err: ManagementError) -> Self {
        Self::BadGateway(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_of(error: ApiError) -> (StatusCode, ErrorBody) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn payload_errors_are_bad_requests() {
        let (status, body) = body_of(CourierError::MissingEndpoint.into()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Bad Request");
        assert_eq!(body.message, "[E1002] No endpoint given");
    }

    #[tokio::test]
    async fn broker_errors_are_internal() {
        let (status, body) = body_of(BrokerError::NotConnected.into()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal Server Error");
        assert_eq!(body.message, "broker handle is not connected");
    }

    #[tokio::test]
    async fn invalid_queue_names_are_bad_requests() {
        let error = BrokerError::InvalidQueueName {
            name: "a.b".to_string(),
            reason: "contains '.'".to_string(),
        };

        let (status, body) = body_of(error.into()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.message.contains("a.b"), "{}", body.message);
    }

    #[tokio::test]
    async fn management_errors_are_bad_gateway() {
        let (status, body) = body_of(ManagementError::Status { status: 401 }.into()).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.error, "Bad Gateway");
    }
}
