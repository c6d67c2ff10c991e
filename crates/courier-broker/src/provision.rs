//! Per-queue topology provisioning.
//!
//! Every courier queue comes with a dead-letter exchange and queue, and a
//! delay exchange that receives the queue's messages back from the delay
//! ladder. [`QueueProvisioner::prepare`] declares all of it once per process
//! per queue name.

use std::sync::Arc;

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use tracing::{info, instrument};

use crate::{
    error::{BrokerError, Result},
    handle::BrokerHandle,
    ladder::DELIVERY_EXCHANGE,
    transport::ExchangeKind,
};

/// Names making up one queue's topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// Main queue consumers read from.
    pub name: String,
    /// Fanout exchange receiving rejected messages.
    pub dead_letter_exchange: String,
    /// Queue collecting rejected messages.
    pub dead_letter_queue: String,
    /// Exchange the ladder hands delayed messages to.
    pub delay_exchange: String,
}

impl QueueRecord {
    /// Derives topology names for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidQueueName`] if `name` is empty or contains
    /// a routing-key separator or wildcard, since it becomes the final segment
    /// of ladder routing keys.
    pub fn for_queue(name: &str) -> Result<Self> {
        let invalid = |reason: &str| BrokerError::InvalidQueueName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.contains(['.', '*', '#']) {
            return Err(invalid("name must not contain '.', '*' or '#'"));
        }

        Ok(Self {
            name: name.to_string(),
            dead_letter_exchange: format!("{name}-dead-letter-exchange"),
            dead_letter_queue: format!("{name}-dead-letter-queue"),
            delay_exchange: format!("{name}-delay-delivery"),
        })
    }

    /// Pattern binding the delay exchange into the ladder's delivery exchange.
    pub fn ladder_pattern(&self) -> String {
        format!("#.{}", self.name)
    }

    fn main_queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.dead_letter_exchange.as_str())),
        );
        arguments
    }
}

/// Catch-all binding key on the topic delay exchange. An empty key would
/// only match messages with an empty routing key.
const CATCH_ALL: &str = "#";

/// Declares queue topology, at most once per queue name.
#[derive(Debug, Clone)]
pub struct QueueProvisioner {
    broker: Arc<BrokerHandle>,
}

impl QueueProvisioner {
    /// Creates a provisioner caching into `broker`.
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self { broker }
    }

    /// Ensures `name` and its dead-letter and delay topology exist.
    ///
    /// The first call for a name declares everything; later calls, including
    /// ones racing the first, return the cached record without touching the
    /// broker. The delay ladder must already be built because the delay
    /// exchange is bound into it.
    ///
    /// # Errors
    ///
    /// Returns the first broker error. Nothing is cached on failure, so the
    /// next call starts over.
    pub async fn prepare(&self, name: &str) -> Result<Arc<QueueRecord>> {
        let record = QueueRecord::for_queue(name)?;
        let slot = self.broker.queue_slot(name);
        let prepared = slot.get_or_try_init(|| self.declare(record)).await?;
        Ok(Arc::clone(prepared))
    }

    #[instrument(name = "prepare_queue", skip(self, record), fields(queue = %record.name))]
    async fn declare(&self, record: QueueRecord) -> Result<Arc<QueueRecord>> {
        let channel = self.broker.borrow_channel().await?;

        channel.declare_exchange(&record.dead_letter_exchange, ExchangeKind::Fanout).await?;
        channel.declare_queue(&record.dead_letter_queue, FieldTable::default()).await?;
        channel.bind_queue(&record.dead_letter_queue, &record.dead_letter_exchange, "").await?;

        let pending = channel.declare_queue(&record.name, record.main_queue_arguments()).await?;

        channel.declare_exchange(&record.delay_exchange, ExchangeKind::Topic).await?;
        channel
            .bind_exchange(&record.delay_exchange, DELIVERY_EXCHANGE, &record.ladder_pattern())
            .await?;
        channel.bind_queue(&record.name, &record.delay_exchange, CATCH_ALL).await?;

        info!(pending, dead_letter_queue = %record.dead_letter_queue, "queue provisioned");
        Ok(Arc::new(record))
    }
}
