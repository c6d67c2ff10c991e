//! A single consuming loop.
//!
//! Each worker owns one borrowed channel with its own prefetch window and
//! consumer registration. Deliveries are processed one at a time: decode,
//! replay, then ack or hand off to the retry engine. Cancellation is observed
//! only between deliveries.

use std::sync::Arc;

use courier_broker::{
    headers::{read_i64, ATTEMPT_NUMBER_HEADER},
    BrokerHandle, Delivery, QueueRecord,
};
use courier_core::Payload;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result},
    retry::{RetryEngine, RetryOutcome},
    worker_pool::PoolStats,
};

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    /// The endpoint answered 2xx and the message was acked.
    Delivered,
    /// The payload was unusable and the message was dead-lettered.
    Malformed,
    /// The replay failed and the retry engine took over.
    Failed(RetryOutcome),
}

pub(crate) struct ConsumerWorker {
    id: usize,
    queue: Arc<QueueRecord>,
    broker: Arc<BrokerHandle>,
    client: Arc<DeliveryClient>,
    retry: Arc<RetryEngine>,
    stats: Arc<RwLock<PoolStats>>,
    prefetch: u16,
    cancellation_token: CancellationToken,
}

impl ConsumerWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        queue: Arc<QueueRecord>,
        broker: Arc<BrokerHandle>,
        client: Arc<DeliveryClient>,
        retry: Arc<RetryEngine>,
        stats: Arc<RwLock<PoolStats>>,
        prefetch: u16,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, queue, broker, client, retry, stats, prefetch, cancellation_token }
    }

    fn consumer_tag(&self) -> String {
        format!("{}-worker-{}", self.queue.name, self.id)
    }

    /// Consumes until cancelled or the delivery stream ends.
    ///
    /// # Errors
    ///
    /// Returns `StreamClosed` when the broker ends the stream, or the broker
    /// error that prevented consuming.
    pub(crate) async fn run(&self) -> Result<()> {
        let channel = self.broker.borrow_channel().await?;
        channel.set_prefetch(self.prefetch).await?;

        let tag = self.consumer_tag();
        let mut deliveries = channel.consume(&self.queue.name, &tag).await?;
        debug!(worker_id = self.id, consumer_tag = %tag, "consumer registered");

        loop {
            tokio::select! {
                biased;

                () = self.cancellation_token.cancelled() => {
                    if let Err(e) = channel.cancel(&tag).await {
                        warn!(worker_id = self.id, error = %e, "failed to cancel consumer");
                    }
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.process(delivery).await {
                            warn!(worker_id = self.id, error = %e, "failed to settle delivery");
                        }
                    },
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(DeliveryError::StreamClosed { worker_id: self.id }),
                },
            }
        }
    }

    /// Replays one delivery and settles it.
    ///
    /// # Errors
    ///
    /// Returns an error only when the final ack or reject fails.
    pub(crate) async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome> {
        let span = info_span!(
            "delivery",
            worker_id = self.id,
            queue = %self.queue.name,
            delivery_tag = delivery.delivery_tag
        );

        async move {
            self.stats.write().await.deliveries_received += 1;

            let request = match Payload::decode(&delivery.body)
                .map_err(DeliveryError::from)
                .and_then(|payload| {
                    let attempt = read_i64(&delivery.headers, ATTEMPT_NUMBER_HEADER)
                        .ok()
                        .flatten()
                        .unwrap_or(0);
                    DeliveryRequest::from_payload(&payload, attempt)
                }) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "discarding malformed payload");
                    delivery.reject_discard().await?;
                    self.stats.write().await.malformed_payloads += 1;
                    return Ok(ProcessOutcome::Malformed);
                },
            };

            match self.client.deliver(request).await.and_then(DeliveryResponse::into_result) {
                Ok(response) => {
                    delivery.ack().await?;
                    info!(status = response.status_code, "message delivered");
                    self.stats.write().await.successful_deliveries += 1;
                    Ok(ProcessOutcome::Delivered)
                },
                Err(e) => {
                    warn!(error = %e, "replay failed");
                    let outcome = self.retry.handle_failure(delivery, &self.queue).await?;

                    let mut stats = self.stats.write().await;
                    stats.failed_deliveries += 1;
                    match outcome {
                        RetryOutcome::Redelivered { .. } => stats.redelivered += 1,
                        RetryOutcome::DeadLettered => stats.dead_lettered += 1,
                        RetryOutcome::Requeued => stats.requeued += 1,
                    }
                    Ok(ProcessOutcome::Failed(outcome))
                },
            }
        }
        .instrument(span)
        .await
    }
}
