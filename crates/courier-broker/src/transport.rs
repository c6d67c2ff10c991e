//! Transport abstraction over the message broker.
//!
//! Every broker command courier issues goes through the traits in this
//! module. Production code uses the AMQP adapter in [`crate::amqp`]; tests use
//! the in-memory broker from the `courier-testing` crate, which implements
//! the same routing rules so topology and retry behavior can be verified
//! without a server.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures::Stream;
use lapin::types::FieldTable;
use tracing::warn;

use crate::error::{BrokerError, Result};

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of deliveries produced by a consumer registration.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to every binding regardless of key.
    Fanout,
    /// Routes by matching dot-separated keys against binding patterns.
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => write!(f, "fanout"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// Establishes broker connections.
pub trait Connector: Send + Sync + 'static {
    /// Opens a connection to the broker at `uri`.
    fn connect<'a>(&'a self, uri: &'a str) -> BrokerFuture<'a, Arc<dyn BrokerConnection>>;
}

/// A live broker connection.
pub trait BrokerConnection: Send + Sync + 'static {
    /// Opens a new channel multiplexed over this connection.
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;
}

/// Commands courier issues over a channel.
///
/// All declarations are durable. Arguments are passed through untouched so
/// that queue features such as `x-message-ttl` and `x-dead-letter-exchange`
/// stay visible at the call site.
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declares a durable exchange.
    fn declare_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()>;

    /// Declares a durable queue and returns its current message count.
    fn declare_queue<'a>(&'a self, name: &'a str, arguments: FieldTable)
        -> BrokerFuture<'a, u32>;

    /// Passively declares an existing queue and returns its message count.
    ///
    /// Fails if the queue does not exist.
    fn inspect_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, u32>;

    /// Binds `queue` to `exchange` with `routing_key`.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Routes messages published to `source` that match `routing_key` on to
    /// `destination`.
    fn bind_exchange<'a>(
        &'a self,
        destination: &'a str,
        source: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Deletes a queue together with its bindings.
    fn delete_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Deletes an exchange together with its bindings.
    fn delete_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Publishes a persistent message and waits for the broker to accept it.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()>;

    /// Limits unacknowledged deliveries outstanding on this channel.
    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()>;

    /// Registers a consumer on `queue`.
    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str)
        -> BrokerFuture<'a, DeliveryStream>;

    /// Cancels a consumer registered with [`BrokerChannel::consume`].
    fn cancel<'a>(&'a self, consumer_tag: &'a str) -> BrokerFuture<'a, ()>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    /// Body bytes, passed through unchanged.
    pub body: Bytes,
    /// Message headers.
    pub headers: FieldTable,
    /// MIME content type.
    pub content_type: Option<String>,
}

/// Terminal action taken on a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processing finished; remove the message.
    Ack,
    /// Return the message to the broker. With `requeue` false the broker
    /// dead-letters it through the queue's `x-dead-letter-exchange`.
    Reject {
        /// Put the message back on the queue instead of dead-lettering it
        requeue: bool,
    },
}

/// Settles one delivery with the broker.
pub trait Acknowledger: Send + Sync + 'static {
    /// Applies `settlement` to the delivery this acknowledger belongs to.
    fn settle(self: Box<Self>, settlement: Settlement) -> BrokerFuture<'static, ()>;
}

/// One message taken off a queue.
///
/// The terminal actions consume the delivery, so at most one of them can run.
/// A delivery dropped without being settled is requeued in the background and
/// logged, which keeps the channel's prefetch window from stalling.
pub struct Delivery {
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Routing key the message was published or dead-lettered with.
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// MIME content type, if the publisher set one.
    pub content_type: Option<String>,
    /// Message headers.
    pub headers: FieldTable,
    /// Body bytes.
    pub body: Bytes,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        body: Bytes,
        headers: FieldTable,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered: false,
            content_type: None,
            headers,
            body,
            acker: Some(acker),
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Marks the delivery as a broker redelivery.
    #[must_use]
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Acknowledges the delivery.
    pub async fn ack(self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    /// Rejects without requeue, dead-lettering the message.
    pub async fn reject_discard(self) -> Result<()> {
        self.settle(Settlement::Reject { requeue: false }).await
    }

    /// Rejects and puts the message back on its queue.
    pub async fn reject_requeue(self) -> Result<()> {
        self.settle(Settlement::Reject { requeue: true }).await
    }

    async fn settle(mut self, settlement: Settlement) -> Result<()> {
        let acker = self
            .acker
            .take()
            .ok_or_else(|| BrokerError::acknowledgement("delivery already settled"))?;
        acker.settle(settlement).await
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(acker) = self.acker.take() else {
            return;
        };

        warn!(delivery_tag = self.delivery_tag, "delivery dropped unsettled, requeueing");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = acker.settle(Settlement::Reject { requeue: true }).await {
                    warn!(error = %e, "failed to requeue dropped delivery");
                }
            });
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("settled", &self.acker.is_none())
            .finish()
    }
}
