//! Broker-native retry with exponential backoff.
//!
//! A failed delivery is not held in memory while it waits. Its retry state
//! travels in message headers, and the wait itself is the delay ladder: the
//! engine republishes the message into the ladder with the backoff encoded in
//! the routing key, and the ladder hands it back to the queue when the time
//! is up.
//!
//! The decision ([`decide`]) is a pure function of the headers; the action
//! ([`RetryEngine::handle_failure`]) carries it out against the broker.

use std::sync::Arc;

use courier_broker::{
    encode_routing_key,
    headers::{
        read_i64, write_i64, ATTEMPT_NUMBER_HEADER, REMAINING_RETRIES_HEADER,
        RETRY_DELAY_BASE_HEADER,
    },
    BrokerHandle, DelayLadder, Delivery, FieldTable, OutboundMessage, QueueRecord,
    MAX_DELAY_SECONDS,
};
use tracing::{debug, error, info};

use crate::error::Result;

/// What to do with a message whose delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the message through the ladder and try again.
    Redeliver {
        /// Value for `x-remaining-retries` on the republished message
        remaining_retries: i64,
        /// Value for `x-attempt-number` on the republished message
        attempt_number: i64,
        /// Seconds to wait in the ladder
        delay_seconds: u64,
    },
    /// Give up and let the queue dead-letter the message.
    DeadLetter {
        /// Why the message will not be retried
        reason: String,
    },
}

/// What the engine ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Republished into the ladder and acked.
    Redelivered {
        /// Ladder delay the message was published with
        delay_seconds: u64,
    },
    /// Rejected without requeue into the dead-letter queue.
    DeadLettered,
    /// The republish failed; the message went back on its queue unchanged.
    Requeued,
}

/// Backoff for a message that has failed `attempt` times before.
///
/// `base × 2^attempt` seconds, saturating at the largest delay the ladder
/// can encode.
pub fn backoff_delay(base_seconds: u64, attempt: u32) -> u64 {
    let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_seconds.saturating_mul(factor).min(MAX_DELAY_SECONDS)
}

/// Decides the fate of a failed message from its retry headers.
///
/// Fails closed: a missing `x-remaining-retries`, an undecodable header, or
/// a negative attempt number all dead-letter the message.
pub fn decide(headers: &FieldTable) -> RetryDecision {
    let remaining = match read_i64(headers, REMAINING_RETRIES_HEADER) {
        Ok(Some(remaining)) => remaining,
        Ok(None) => return dead_letter(format!("{REMAINING_RETRIES_HEADER} header missing")),
        Err(e) => return dead_letter(e.to_string()),
    };

    let attempt = match read_i64(headers, ATTEMPT_NUMBER_HEADER) {
        Ok(attempt) => attempt.unwrap_or(0),
        Err(e) => return dead_letter(e.to_string()),
    };
    if attempt < 0 {
        return dead_letter(format!("negative attempt number {attempt}"));
    }

    if remaining <= 0 {
        return dead_letter(format!("retries exhausted after {attempt} attempts"));
    }

    let base = match read_i64(headers, RETRY_DELAY_BASE_HEADER) {
        Ok(Some(base)) if base > 0 => base.unsigned_abs(),
        Ok(_) => 1,
        Err(e) => return dead_letter(e.to_string()),
    };

    RetryDecision::Redeliver {
        remaining_retries: remaining - 1,
        attempt_number: attempt.saturating_add(1),
        delay_seconds: backoff_delay(base, u32::try_from(attempt).unwrap_or(u32::MAX)),
    }
}

fn dead_letter(reason: String) -> RetryDecision {
    RetryDecision::DeadLetter { reason }
}

/// Carries out retry decisions against the broker.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    broker: Arc<BrokerHandle>,
    ladder: DelayLadder,
}

impl RetryEngine {
    /// Creates an engine publishing into the standard ladder.
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self { broker, ladder: DelayLadder::new() }
    }

    /// Settles a delivery whose HTTP replay failed.
    ///
    /// Either republishes it into the ladder with updated headers and acks
    /// the original, or rejects it into the dead-letter queue. If the
    /// republish cannot happen the original is requeued so it is not lost.
    ///
    /// # Errors
    ///
    /// Returns an error only if the final ack or reject fails.
    pub async fn handle_failure(
        &self,
        delivery: Delivery,
        queue: &QueueRecord,
    ) -> Result<RetryOutcome> {
        let (remaining_retries, attempt_number, delay_seconds) = match decide(&delivery.headers) {
            RetryDecision::Redeliver { remaining_retries, attempt_number, delay_seconds } => {
                (remaining_retries, attempt_number, delay_seconds)
            },
            RetryDecision::DeadLetter { reason } => {
                info!(queue = %queue.name, reason = %reason, "dead-lettering message");
                delivery.reject_discard().await?;
                return Ok(RetryOutcome::DeadLettered);
            },
        };

        let mut headers = delivery.headers.clone();
        write_i64(&mut headers, REMAINING_RETRIES_HEADER, remaining_retries);
        write_i64(&mut headers, ATTEMPT_NUMBER_HEADER, attempt_number);

        let message = OutboundMessage {
            body: delivery.body.clone(),
            headers,
            content_type: delivery.content_type.clone(),
        };

        match self.republish(&queue.name, delay_seconds, message).await {
            Ok(()) => {
                debug!(
                    queue = %queue.name,
                    attempt = attempt_number,
                    remaining = remaining_retries,
                    delay_s = delay_seconds,
                    "scheduled redelivery"
                );
                delivery.ack().await?;
                Ok(RetryOutcome::Redelivered { delay_seconds })
            },
            Err(e) => {
                error!(queue = %queue.name, error = %e, "failed to schedule redelivery, requeueing");
                delivery.reject_requeue().await?;
                Ok(RetryOutcome::Requeued)
            },
        }
    }

    async fn republish(
        &self,
        queue: &str,
        delay_seconds: u64,
        message: OutboundMessage,
    ) -> courier_broker::Result<()> {
        let routing_key = encode_routing_key(queue, delay_seconds)?;
        let channel = self.broker.borrow_channel().await?;
        channel.publish(self.ladder.entry_exchange(), &routing_key, message).await
    }
}

#[cfg(test)]
mod tests {
    use courier_broker::{headers::initial_retry_headers, AMQPValue};

    use super::*;

    fn headers_with(remaining: Option<i64>, attempt: Option<i64>, base: Option<i64>) -> FieldTable {
        let mut headers = FieldTable::default();
        if let Some(remaining) = remaining {
            write_i64(&mut headers, REMAINING_RETRIES_HEADER, remaining);
        }
        if let Some(attempt) = attempt {
            write_i64(&mut headers, ATTEMPT_NUMBER_HEADER, attempt);
        }
        if let Some(base) = base {
            write_i64(&mut headers, RETRY_DELAY_BASE_HEADER, base);
        }
        headers
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let delays: Vec<u64> = (0..5).map(|attempt| backoff_delay(1, attempt)).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(backoff_delay(3, 2), 12);
    }

    #[test]
    fn backoff_saturates_at_ladder_limit() {
        assert_eq!(backoff_delay(1, 28), MAX_DELAY_SECONDS);
        assert_eq!(backoff_delay(1, 64), MAX_DELAY_SECONDS);
        assert_eq!(backoff_delay(u64::MAX, 1), MAX_DELAY_SECONDS);
    }

    #[test]
    fn first_failure_waits_base_seconds() {
        let decision = decide(&initial_retry_headers(2, 5));

        assert_eq!(
            decision,
            RetryDecision::Redeliver { remaining_retries: 1, attempt_number: 1, delay_seconds: 5 }
        );
    }

    #[test]
    fn later_failures_use_attempt_before_increment() {
        let decision = decide(&headers_with(Some(3), Some(2), None));

        assert_eq!(
            decision,
            RetryDecision::Redeliver { remaining_retries: 2, attempt_number: 3, delay_seconds: 4 }
        );
    }

    #[test]
    fn missing_or_exhausted_retries_dead_letter() {
        assert!(matches!(decide(&FieldTable::default()), RetryDecision::DeadLetter { .. }));
        assert!(matches!(
            decide(&headers_with(Some(0), Some(4), None)),
            RetryDecision::DeadLetter { .. }
        ));
        assert!(matches!(
            decide(&headers_with(Some(-1), None, None)),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[test]
    fn negative_attempt_dead_letters() {
        assert!(matches!(
            decide(&headers_with(Some(2), Some(-1), None)),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[test]
    fn undecodable_header_dead_letters() {
        let mut headers = headers_with(Some(2), None, None);
        headers.insert(ATTEMPT_NUMBER_HEADER.into(), AMQPValue::Boolean(true));

        assert!(matches!(decide(&headers), RetryDecision::DeadLetter { .. }));
    }

    #[test]
    fn non_positive_base_falls_back_to_one_second() {
        let decision = decide(&headers_with(Some(1), Some(3), Some(0)));

        assert_eq!(
            decision,
            RetryDecision::Redeliver { remaining_retries: 0, attempt_number: 4, delay_seconds: 8 }
        );
    }

    #[test]
    fn float_headers_are_accepted() {
        let mut headers = FieldTable::default();
        headers.insert(REMAINING_RETRIES_HEADER.into(), AMQPValue::Double(2.0));
        headers.insert(ATTEMPT_NUMBER_HEADER.into(), AMQPValue::Float(1.0));

        assert_eq!(
            decide(&headers),
            RetryDecision::Redeliver { remaining_retries: 1, attempt_number: 2, delay_seconds: 2 }
        );
    }
}
