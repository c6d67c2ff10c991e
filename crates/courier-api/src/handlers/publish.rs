//! Publish endpoints: validate a payload and enqueue it unchanged.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use courier_broker::{headers::initial_retry_headers, OutboundMessage};
use courier_core::Payload;
use tracing::{debug, instrument};

use crate::{error::ApiError, AppState};

/// Exchange that routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// `POST /`
///
/// The body must be a valid payload. It is published byte for byte to the
/// server's own queue with the retry budget and backoff base in headers; the
/// consumer decodes it again on delivery.
#[instrument(name = "publish", skip(state, body), fields(queue = %state.queue.name, bytes = body.len()))]
pub async fn publish(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let payload = Payload::decode(&body)?;
    enqueue(&state, &state.queue.name, &payload, body).await
}

/// `POST /{queue}`
///
/// Like [`publish`], but into the named queue. The queue and its dead-letter
/// and delay topology are declared on first use; names the broker topology
/// cannot carry are rejected with 400.
#[instrument(name = "publish_to_queue", skip(state, body), fields(bytes = body.len()))]
pub async fn publish_to_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let payload = Payload::decode(&body)?;
    let record = state.provisioner.prepare(&queue).await?;
    enqueue(&state, &record.name, &payload, body).await
}

async fn enqueue(
    state: &AppState,
    queue: &str,
    payload: &Payload,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let message = OutboundMessage {
        headers: initial_retry_headers(payload.retries, payload.backoff),
        body,
        content_type: Some("application/json".to_string()),
    };

    let channel = state.broker.borrow_channel().await?;
    channel.publish(DEFAULT_EXCHANGE, queue, message).await?;

    debug!(queue, endpoint = %payload.endpoint, retries = payload.retries, "payload enqueued");
    Ok(StatusCode::NO_CONTENT)
}
