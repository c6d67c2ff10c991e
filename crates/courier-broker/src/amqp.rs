//! AMQP 0-9-1 transport backed by `lapin`.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};

use crate::{
    error::BrokerError,
    transport::{
        Acknowledger, BrokerChannel, BrokerConnection, BrokerFuture, Connector, Delivery,
        DeliveryStream, ExchangeKind, OutboundMessage, Settlement,
    },
};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Connects to a real broker.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    /// Creates a connector using `properties` for every connection.
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

impl fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnector").finish_non_exhaustive()
    }
}

impl Connector for AmqpConnector {
    fn connect<'a>(&'a self, uri: &'a str) -> BrokerFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            let connection = Connection::connect(uri, self.properties.clone())
                .await
                .map_err(|e| BrokerError::connection(e.to_string()))?;
            Ok(Arc::new(AmqpConnection { connection }) as Arc<dyn BrokerConnection>)
        })
    }
}

struct AmqpConnection {
    connection: Connection,
}

impl BrokerConnection for AmqpConnection {
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::channel(e.to_string()))?;
            // Publishes on this channel resolve only once the broker confirms.
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::channel(e.to_string()))?;
            Ok(Arc::new(AmqpChannel { channel }) as Arc<dyn BrokerChannel>)
        })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions { durable: true, ..ExchangeDeclareOptions::default() }
}

impl BrokerChannel for AmqpChannel {
    fn declare_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        Box::pin(async move {
            self.channel
                .exchange_declare(name, kind, durable_exchange(), FieldTable::default())
                .await
                .map_err(|e| BrokerError::operation("exchange_declare", name, e.to_string()))
        })
    }

    fn declare_queue<'a>(
        &'a self,
        name: &'a str,
        arguments: FieldTable,
    ) -> BrokerFuture<'a, u32> {
        Box::pin(async move {
            let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
            let queue = self
                .channel
                .queue_declare(name, options, arguments)
                .await
                .map_err(|e| BrokerError::operation("queue_declare", name, e.to_string()))?;
            Ok(queue.message_count())
        })
    }

    fn inspect_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, u32> {
        Box::pin(async move {
            let options = QueueDeclareOptions { passive: true, ..QueueDeclareOptions::default() };
            let queue = self
                .channel
                .queue_declare(name, options, FieldTable::default())
                .await
                .map_err(|e| BrokerError::operation("queue_inspect", name, e.to_string()))?;
            Ok(queue.message_count())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::operation("queue_bind", queue, e.to_string()))
        })
    }

    fn bind_exchange<'a>(
        &'a self,
        destination: &'a str,
        source: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .exchange_bind(
                    destination,
                    source,
                    routing_key,
                    ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::operation("exchange_bind", destination, e.to_string()))
        })
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_delete(name, QueueDeleteOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::operation("queue_delete", name, e.to_string()))
        })
    }

    fn delete_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .exchange_delete(name, ExchangeDeleteOptions::default())
                .await
                .map_err(|e| BrokerError::operation("exchange_delete", name, e.to_string()))
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut properties = BasicProperties::default()
                .with_headers(message.headers)
                .with_delivery_mode(PERSISTENT);
            if let Some(content_type) = message.content_type {
                properties = properties.with_content_type(ShortString::from(content_type));
            }

            let failed = |e: lapin::Error| {
                BrokerError::operation("basic_publish", exchange, e.to_string())
            };
            let confirmation = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties,
                )
                .await
                .map_err(failed)?
                .await
                .map_err(failed)?;

            match confirmation {
                Confirmation::Nack(_) => Err(BrokerError::operation(
                    "basic_publish",
                    exchange,
                    "broker nacked the publish",
                )),
                Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            }
        })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.channel
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::operation("basic_qos", "channel", e.to_string()))
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::operation("basic_consume", queue, e.to_string()))?;

            let deliveries = consumer.map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| BrokerError::operation("consume", "delivery", e.to_string()))
            });
            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }

    fn cancel<'a>(&'a self, consumer_tag: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(|e| BrokerError::operation("basic_cancel", consumer_tag, e.to_string()))
        })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let headers = delivery.properties.headers().clone().unwrap_or_default();
    let content_type = delivery.properties.content_type().as_ref().map(|ct| ct.as_str().to_string());

    Delivery::new(
        delivery.delivery_tag,
        delivery.routing_key.as_str().to_string(),
        Bytes::from(delivery.data),
        headers,
        Box::new(AmqpAcker { acker: delivery.acker }),
    )
    .with_content_type(content_type)
    .with_redelivered(delivery.redelivered)
}

struct AmqpAcker {
    acker: Acker,
}

impl Acknowledger for AmqpAcker {
    fn settle(self: Box<Self>, settlement: Settlement) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            let result = match settlement {
                Settlement::Ack => self.acker.ack(BasicAckOptions::default()).await.map(|_| ()),
                Settlement::Reject { requeue } => self
                    .acker
                    .nack(BasicNackOptions { requeue, multiple: false })
                    .await
                    .map(|_| ()),
            };
            result.map_err(|e| BrokerError::acknowledgement(e.to_string()))
        })
    }
}
