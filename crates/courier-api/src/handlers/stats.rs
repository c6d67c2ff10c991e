//! Queue statistics endpoint, backed by the management API.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiError, management::QueueStats, AppState};

/// Wire format of `GET /stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsResponse {
    /// Messages currently in the queue
    pub messages: u64,
    /// Publish rate, messages per second
    pub in_rate: f64,
    /// Acknowledgement rate, messages per second
    pub out_rate: f64,
}

impl From<QueueStats> for StatsResponse {
    fn from(stats: QueueStats) -> Self {
        Self { messages: stats.messages, in_rate: stats.in_rate, out_rate: stats.out_rate }
    }
}

/// `GET /stats`
#[instrument(name = "queue_stats", skip(state), fields(queue = %state.queue.name))]
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let management = state
        .management
        .as_ref()
        .ok_or_else(|| ApiError::Internal("management url is not configured".to_string()))?;

    let stats = management.queue_stats(&state.queue.name).await?;
    Ok(Json(stats.into()))
}
