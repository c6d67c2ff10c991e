//! Binary delay ladder built from TTL queues and dead-lettering.
//!
//! The ladder delays a message by any whole number of seconds below 2^28
//! using nothing but broker primitives. The delay is written into the routing
//! key as 28 binary digits, most significant first, followed by the
//! destination queue name:
//!
//! ```text
//! 0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1.0.1.0.orders   (10s)
//! ```
//!
//! # Topology
//!
//! Layer `i` (0..=27) owns exchange `delay-infra-{i:02}` and queue
//! `delay-queue-{i:02}`. Every layer inspects digit `i` of the key:
//!
//! 1. **Bit set** - the layer queue holds the message for 2^i seconds, then
//!    dead-letters it to the next lower layer's exchange.
//! 2. **Bit clear** - an exchange-to-exchange binding forwards the message to
//!    the next lower layer immediately.
//!
//! Layer 0 forwards to `delay-infra-deliver`, where each provisioned queue
//! binds its delay exchange with `#.{queue}`. Dead-lettering keeps the
//! original routing key, so the same key is matched at every layer and the
//! total wait is the sum of 2^i over the set digits.

use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use tracing::{debug, info};

use crate::{
    error::{BrokerError, Result},
    handle::BrokerHandle,
    transport::ExchangeKind,
};

/// Number of binary digits, and layers, in the ladder.
pub const LADDER_BITS: u32 = 28;

/// Largest delay the ladder can express.
pub const MAX_DELAY_SECONDS: u64 = (1 << LADDER_BITS) - 1;

/// Exchange every delayed message reaches after the last layer.
pub const DELIVERY_EXCHANGE: &str = "delay-infra-deliver";

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayLayer {
    /// Layer index; also the key digit this layer inspects, counted from the
    /// least significant end.
    pub index: u32,
    /// Topic exchange receiving messages for this layer.
    pub exchange: String,
    /// Queue holding messages whose digit is set.
    pub queue: String,
    /// Time a message waits in `queue`.
    pub ttl: Duration,
    /// Binding of `queue` to `exchange` matching a set digit.
    pub active_pattern: String,
    /// Binding from `exchange` to `next_exchange` matching a clear digit.
    pub inactive_pattern: String,
    /// Exchange the layer hands messages to, by expiry or pass-through.
    pub next_exchange: String,
}

impl DelayLayer {
    fn new(index: u32) -> Self {
        let next_exchange =
            if index == 0 { DELIVERY_EXCHANGE.to_string() } else { layer_exchange(index - 1) };

        Self {
            index,
            exchange: layer_exchange(index),
            queue: format!("delay-queue-{index:02}"),
            ttl: Duration::from_secs(1 << index),
            active_pattern: layer_pattern(index, '1'),
            inactive_pattern: layer_pattern(index, '0'),
            next_exchange,
        }
    }

    /// Queue arguments: expiry and where expired messages go.
    pub fn queue_arguments(&self) -> FieldTable {
        let ttl_millis = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);

        let mut arguments = FieldTable::default();
        arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongLongInt(ttl_millis));
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.next_exchange.as_str())),
        );
        arguments
    }
}

fn layer_exchange(index: u32) -> String {
    format!("delay-infra-{index:02}")
}

/// Pattern matching keys whose digit for `index` equals `bit`. The more
/// significant digits ahead of it are wildcarded.
fn layer_pattern(index: u32, bit: char) -> String {
    let leading = (LADDER_BITS - 1 - index) as usize;
    format!("{}{bit}.#", "*.".repeat(leading))
}

/// The full ladder topology.
///
/// Generated once; build, teardown and routing all read from the same table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayLadder {
    layers: Vec<DelayLayer>,
}

impl Default for DelayLadder {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayLadder {
    /// Generates the layer table.
    pub fn new() -> Self {
        Self { layers: (0..LADDER_BITS).map(DelayLayer::new).collect() }
    }

    /// Layers ordered from 0 (shortest wait) to 27.
    pub fn layers(&self) -> &[DelayLayer] {
        &self.layers
    }

    /// Exchange delayed messages are published to.
    pub fn entry_exchange(&self) -> &str {
        self.layers.last().map_or(DELIVERY_EXCHANGE, |layer| layer.exchange.as_str())
    }

    /// Declares the delivery exchange and every layer.
    ///
    /// Layers are built from 0 upwards so each layer's dead-letter target and
    /// pass-through destination already exist when it is bound.
    ///
    /// # Errors
    ///
    /// Returns the first broker error; layers declared before it stay in place
    /// and a rerun completes the build.
    pub async fn build(&self, broker: &BrokerHandle) -> Result<()> {
        let channel = broker.borrow_channel().await?;

        channel.declare_exchange(DELIVERY_EXCHANGE, ExchangeKind::Topic).await?;

        for layer in &self.layers {
            channel.declare_exchange(&layer.exchange, ExchangeKind::Topic).await?;
            channel.declare_queue(&layer.queue, layer.queue_arguments()).await?;
            channel.bind_queue(&layer.queue, &layer.exchange, &layer.active_pattern).await?;
            channel
                .bind_exchange(&layer.next_exchange, &layer.exchange, &layer.inactive_pattern)
                .await?;
            debug!(layer = layer.index, exchange = %layer.exchange, "delay layer declared");
        }

        info!(layers = self.layers.len(), entry = %self.entry_exchange(), "delay ladder built");
        Ok(())
    }

    /// Deletes every layer from 27 down to 0, then the delivery exchange.
    ///
    /// # Errors
    ///
    /// Returns the first broker error.
    pub async fn destroy(&self, broker: &BrokerHandle) -> Result<()> {
        let channel = broker.borrow_channel().await?;

        for layer in self.layers.iter().rev() {
            channel.delete_queue(&layer.queue).await?;
            channel.delete_exchange(&layer.exchange).await?;
            debug!(layer = layer.index, "delay layer deleted");
        }
        channel.delete_exchange(DELIVERY_EXCHANGE).await?;

        info!("delay ladder destroyed");
        Ok(())
    }
}

/// Renders `delay_seconds` as a ladder routing key for `queue`.
///
/// # Errors
///
/// Returns [`BrokerError::DelayOutOfRange`] when the delay needs more than
/// 28 bits.
pub fn encode_routing_key(queue: &str, delay_seconds: u64) -> Result<String> {
    if delay_seconds > MAX_DELAY_SECONDS {
        return Err(BrokerError::DelayOutOfRange {
            delay_seconds,
            max_seconds: MAX_DELAY_SECONDS,
        });
    }

    let digits = format!("{delay_seconds:0width$b}", width = LADDER_BITS as usize);
    let mut key = String::with_capacity(digits.len() * 2 + queue.len());
    for digit in digits.chars() {
        key.push(digit);
        key.push('.');
    }
    key.push_str(queue);
    Ok(key)
}

/// Splits a ladder routing key into its delay and destination queue.
///
/// # Errors
///
/// Returns [`BrokerError::MalformedRoutingKey`] when the key does not start
/// with 28 binary digits followed by a non-empty queue name.
pub fn decode_routing_key(key: &str) -> Result<(u64, &str)> {
    let malformed = |reason: &str| BrokerError::MalformedRoutingKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut delay = 0u64;
    let mut rest = key;
    for _ in 0..LADDER_BITS {
        let (digit, tail) = rest.split_once('.').ok_or_else(|| malformed("too few digits"))?;
        let bit = match digit {
            "0" => 0,
            "1" => 1,
            _ => return Err(malformed("digit is not 0 or 1")),
        };
        delay = (delay << 1) | bit;
        rest = tail;
    }

    if rest.is_empty() {
        return Err(malformed("missing queue name"));
    }
    Ok((delay, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::topic_matches;

    #[test]
    fn zero_delay_key_is_all_zero_digits() {
        assert_eq!(
            encode_routing_key("q", 0).unwrap(),
            "0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.q"
        );
    }

    #[test]
    fn ten_second_key_sets_bits_three_and_one() {
        let key = encode_routing_key("q", 10).unwrap();

        assert!(key.ends_with(".0.1.0.1.0.q"), "key {key}");
        assert_eq!(key.split('.').count(), 29);
    }

    #[test]
    fn hundred_second_key_matches_known_value() {
        assert_eq!(
            encode_routing_key("q", 100).unwrap(),
            "0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1.1.0.0.1.0.0.q"
        );
    }

    #[test]
    fn delays_beyond_28_bits_are_rejected() {
        assert!(encode_routing_key("q", MAX_DELAY_SECONDS).is_ok());
        assert_eq!(
            encode_routing_key("q", MAX_DELAY_SECONDS + 1).unwrap_err(),
            BrokerError::DelayOutOfRange {
                delay_seconds: MAX_DELAY_SECONDS + 1,
                max_seconds: MAX_DELAY_SECONDS
            }
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let key = encode_routing_key("orders", 86_400).unwrap();
        assert_eq!(decode_routing_key(&key).unwrap(), (86_400, "orders"));
    }

    #[test]
    fn decode_rejects_malformed_keys() {
        assert!(decode_routing_key("0.1.q").is_err());
        assert!(decode_routing_key(&format!("{}2.q", "0.".repeat(27))).is_err());
        assert!(decode_routing_key(&"0.".repeat(28)).is_err());
    }

    #[test]
    fn layer_table_has_expected_names_and_ttls() {
        let ladder = DelayLadder::new();
        let layers = ladder.layers();

        assert_eq!(layers.len(), 28);
        assert_eq!(layers[0].exchange, "delay-infra-00");
        assert_eq!(layers[0].queue, "delay-queue-00");
        assert_eq!(layers[0].next_exchange, DELIVERY_EXCHANGE);
        assert_eq!(layers[0].ttl, Duration::from_secs(1));
        assert_eq!(layers[5].next_exchange, "delay-infra-04");
        assert_eq!(layers[27].ttl, Duration::from_secs(1 << 27));
        assert_eq!(ladder.entry_exchange(), "delay-infra-27");
    }

    #[test]
    fn layer_patterns_wildcard_more_significant_digits() {
        let ladder = DelayLadder::new();

        assert_eq!(ladder.layers()[27].active_pattern, "1.#");
        assert_eq!(ladder.layers()[27].inactive_pattern, "0.#");
        assert_eq!(ladder.layers()[0].active_pattern, format!("{}1.#", "*.".repeat(27)));
    }

    #[test]
    fn exactly_one_layer_binding_matches_each_key() {
        let ladder = DelayLadder::new();
        let key = encode_routing_key("q", 10).unwrap();

        for layer in ladder.layers() {
            let active = topic_matches(&layer.active_pattern, &key);
            let inactive = topic_matches(&layer.inactive_pattern, &key);
            assert!(active ^ inactive, "layer {}", layer.index);
            assert_eq!(active, layer.index == 1 || layer.index == 3);
        }
    }

    #[test]
    fn queue_arguments_carry_ttl_and_dead_letter_target() {
        let arguments = DelayLadder::new().layers()[3].queue_arguments();
        let inner = arguments.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(8_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("delay-infra-02")))
        );
    }
}
