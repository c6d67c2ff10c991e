//! Health endpoint.
//!
//! The service counts as healthy while its dead-letter queue is empty.
//! Anything in the dead-letter queue needs an operator, so a non-zero depth
//! fails the check the same way a broker outage does.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{error::ApiError, AppState};

/// Health check response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"healthy"`; failures are reported as errors
    pub status: String,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Queue the server publishes to
    pub queue: String,
    /// Dead-letter queue that was inspected
    pub dead_letter_queue: String,
    /// Messages waiting in the dead-letter queue
    pub dead_letter_depth: u32,
    /// Service version
    pub version: String,
}

/// `GET /health`
#[instrument(name = "health_check", skip(state), fields(queue = %state.queue.name))]
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let channel = state.broker.borrow_channel().await?;
    let depth = channel.inspect_queue(&state.queue.dead_letter_queue).await?;

    if depth != 0 {
        return Err(ApiError::Internal(format!("DLQ has {depth} items")));
    }

    debug!("health check passed");
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        queue: state.queue.name.clone(),
        dead_letter_queue: state.queue.dead_letter_queue.clone(),
        dead_letter_depth: depth,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
