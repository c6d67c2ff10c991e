//! In-memory broker.
//!
//! Implements the subset of broker behavior courier relies on: durable
//! declarations with equivalence checks, fanout and topic routing, the
//! default exchange, exchange-to-exchange bindings, per-queue TTL, dead
//! lettering on expiry and on reject-without-requeue, and competing
//! consumers. Every command is logged so tests can assert on exactly what
//! was sent, individual commands can be made to fail, and publishes can be
//! nacked after the fact the way a broker with publisher confirms does.
//!
//! TTL expiry runs on tokio timers, so tests using a paused clock observe
//! ladder delays exactly.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::channel::mpsc;
use lapin::types::{AMQPValue, FieldTable, ShortString};

use courier_broker::{
    headers::header_to_i64,
    topic::topic_matches,
    transport::{
        Acknowledger, BrokerChannel, BrokerConnection, BrokerFuture, Connector, Delivery,
        DeliveryStream, ExchangeKind, OutboundMessage, Settlement,
    },
    BrokerError, Result,
};

/// A broker command as received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `exchange_declare`
    DeclareExchange {
        /// Exchange name
        name: String,
        /// Exchange type
        kind: ExchangeKind,
    },
    /// Non-passive `queue_declare`
    DeclareQueue {
        /// Queue name
        name: String,
    },
    /// Passive `queue_declare`
    InspectQueue {
        /// Queue name
        name: String,
    },
    /// `queue_bind`
    BindQueue {
        /// Queue name
        queue: String,
        /// Source exchange
        exchange: String,
        /// Binding key
        routing_key: String,
    },
    /// `exchange_bind`
    BindExchange {
        /// Destination exchange
        destination: String,
        /// Source exchange
        source: String,
        /// Binding key
        routing_key: String,
    },
    /// `queue_delete`
    DeleteQueue {
        /// Queue name
        name: String,
    },
    /// `exchange_delete`
    DeleteExchange {
        /// Exchange name
        name: String,
    },
    /// `basic_publish`
    Publish {
        /// Target exchange
        exchange: String,
        /// Routing key
        routing_key: String,
    },
    /// `basic_qos`
    SetPrefetch {
        /// Prefetch count
        count: u16,
    },
    /// `basic_consume`
    Consume {
        /// Queue name
        queue: String,
        /// Consumer tag
        consumer_tag: String,
    },
    /// `basic_cancel`
    Cancel {
        /// Consumer tag
        consumer_tag: String,
    },
}

/// Command category, used for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `exchange_declare`
    DeclareExchange,
    /// Non-passive `queue_declare`
    DeclareQueue,
    /// Passive `queue_declare`
    InspectQueue,
    /// `queue_bind`
    BindQueue,
    /// `exchange_bind`
    BindExchange,
    /// `queue_delete`
    DeleteQueue,
    /// `exchange_delete`
    DeleteExchange,
    /// `basic_publish`
    Publish,
    /// `basic_qos`
    SetPrefetch,
    /// `basic_consume`
    Consume,
    /// `basic_cancel`
    Cancel,
}

impl Operation {
    /// Category of this command.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::DeclareExchange { .. } => OperationKind::DeclareExchange,
            Self::DeclareQueue { .. } => OperationKind::DeclareQueue,
            Self::InspectQueue { .. } => OperationKind::InspectQueue,
            Self::BindQueue { .. } => OperationKind::BindQueue,
            Self::BindExchange { .. } => OperationKind::BindExchange,
            Self::DeleteQueue { .. } => OperationKind::DeleteQueue,
            Self::DeleteExchange { .. } => OperationKind::DeleteExchange,
            Self::Publish { .. } => OperationKind::Publish,
            Self::SetPrefetch { .. } => OperationKind::SetPrefetch,
            Self::Consume { .. } => OperationKind::Consume,
            Self::Cancel { .. } => OperationKind::Cancel,
        }
    }

    fn name(&self) -> &'static str {
        match self.kind() {
            OperationKind::DeclareExchange => "exchange_declare",
            OperationKind::DeclareQueue => "queue_declare",
            OperationKind::InspectQueue => "queue_inspect",
            OperationKind::BindQueue => "queue_bind",
            OperationKind::BindExchange => "exchange_bind",
            OperationKind::DeleteQueue => "queue_delete",
            OperationKind::DeleteExchange => "exchange_delete",
            OperationKind::Publish => "basic_publish",
            OperationKind::SetPrefetch => "basic_qos",
            OperationKind::Consume => "basic_consume",
            OperationKind::Cancel => "basic_cancel",
        }
    }
}

/// A message sitting in a mock queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    /// Routing key the message was published or dead-lettered with.
    pub routing_key: String,
    /// Body bytes.
    pub body: Bytes,
    /// Headers.
    pub headers: FieldTable,
    /// Content type.
    pub content_type: Option<String>,
    /// Whether the message was requeued after a delivery.
    pub redelivered: bool,
}

/// Settlement totals across all deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementCounts {
    /// Acknowledged deliveries.
    pub acked: usize,
    /// Deliveries rejected with requeue.
    pub requeued: usize,
    /// Deliveries rejected without requeue.
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    pattern: String,
    target: Target,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    message: MockMessage,
}

struct Consumer {
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Queue {
    arguments: FieldTable,
    ttl: Option<Duration>,
    dead_letter_exchange: Option<String>,
    ready: VecDeque<Stored>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    fn new(arguments: FieldTable) -> Result<Self> {
        let ttl = match arguments.inner().get(&ShortString::from("x-message-ttl")) {
            Some(value) => {
                let millis = header_to_i64("x-message-ttl", value)?;
                Some(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
            },
            None => None,
        };
        let dead_letter_exchange =
            arguments.inner().get(&ShortString::from("x-dead-letter-exchange")).and_then(
                |value| match value {
                    AMQPValue::LongString(s) => {
                        Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
                    },
                    AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
                    _ => None,
                },
            );

        Ok(Self {
            arguments,
            ttl,
            dead_letter_exchange,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        })
    }
}

#[derive(Default)]
struct State {
    connections: usize,
    channels: Vec<Arc<AtomicBool>>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    operations: Vec<Operation>,
    failures: HashMap<OperationKind, usize>,
    nacked_publishes: usize,
    fail_connect: bool,
    settlements: SettlementCounts,
}

impl State {
    fn record(&mut self, operation: Operation) -> Result<()> {
        let kind = operation.kind();
        let name = operation.name();
        self.operations.push(operation);

        match self.failures.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BrokerError::operation(name, "mock", "injected failure"))
            },
            _ => Ok(()),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>> {
        let mut queues = BTreeSet::new();
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                queues.insert(routing_key.to_string());
            }
            return Ok(queues);
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::operation(
                "basic_publish",
                exchange,
                "NOT_FOUND - no exchange",
            ));
        }

        let mut visited = BTreeSet::new();
        let mut pending = vec![exchange.to_string()];
        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(current) = self.exchanges.get(&name) else {
                continue;
            };
            for binding in &current.bindings {
                let matched = match current.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
                };
                if !matched {
                    continue;
                }
                match &binding.target {
                    Target::Queue(queue) => {
                        queues.insert(queue.clone());
                    },
                    Target::Exchange(next) => pending.push(next.clone()),
                }
            }
        }
        Ok(queues)
    }

    fn remove_bindings_to(&mut self, target: &Target) {
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| &binding.target != target);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(self: &Arc<Self>, exchange: &str, message: MockMessage) -> Result<()> {
        let mut state = self.lock();
        let targets = state.route(exchange, &message.routing_key)?;
        for queue in targets {
            self.enqueue(&mut state, &queue, message.clone(), false);
        }
        Ok(())
    }

    fn enqueue(self: &Arc<Self>, state: &mut State, queue: &str, message: MockMessage, front: bool) {
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        let stored = Stored { id: self.next_id.fetch_add(1, Ordering::Relaxed), message };
        if let Some(ttl) = target.ttl {
            let inner = Arc::clone(self);
            let queue = queue.to_string();
            let id = stored.id;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire(&queue, id);
            });
        }

        if front {
            target.ready.push_front(stored);
        } else {
            target.ready.push_back(stored);
        }
        self.dispatch(state, queue);
    }

    fn dispatch(self: &Arc<Self>, state: &mut State, queue: &str) {
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        while !target.consumers.is_empty() {
            let index = target.next_consumer % target.consumers.len();
            if target.consumers[index].sender.is_closed() {
                target.consumers.remove(index);
                continue;
            }
            let Some(stored) = target.ready.pop_front() else {
                break;
            };
            target.next_consumer = target.next_consumer.wrapping_add(1);

            let message = stored.message.clone();
            let acker = MockAcker { inner: Arc::clone(self), queue: queue.to_string(), stored };
            let delivery = Delivery::new(
                acker.stored.id,
                message.routing_key,
                message.body,
                message.headers,
                Box::new(acker),
            )
            .with_content_type(message.content_type)
            .with_redelivered(message.redelivered);

            // A receiver dropped mid-send hands the delivery back; dropping it
            // requeues the message.
            if target.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                target.consumers.remove(index);
            }
        }
    }

    fn expire(self: &Arc<Self>, queue: &str, id: u64) {
        let mut state = self.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = target.ready.iter().position(|stored| stored.id == id) else {
            return;
        };
        if let Some(stored) = target.ready.remove(position) {
            self.dead_letter(&mut state, queue, stored.message);
        }
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue: &str, message: MockMessage) {
        let Some(exchange) =
            state.queues.get(queue).and_then(|target| target.dead_letter_exchange.clone())
        else {
            return;
        };
        let Ok(targets) = state.route(&exchange, &message.routing_key) else {
            return;
        };
        for target in targets {
            self.enqueue(state, &target, message.clone(), false);
        }
    }

    fn settle(self: &Arc<Self>, queue: &str, message: MockMessage, settlement: Settlement) {
        let mut state = self.lock();
        match settlement {
            Settlement::Ack => state.settlements.acked += 1,
            Settlement::Reject { requeue: true } => {
                state.settlements.requeued += 1;
                let message = MockMessage { redelivered: true, ..message };
                self.enqueue(&mut state, queue, message, true);
            },
            Settlement::Reject { requeue: false } => {
                state.settlements.discarded += 1;
                self.dead_letter(&mut state, queue, message);
            },
        }
    }
}

/// In-memory broker. Clones share state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { state: Mutex::default(), next_id: AtomicU64::new(1) }) }
    }

    /// Makes the next `times` commands of `kind` fail.
    pub fn fail_next(&self, kind: OperationKind, times: usize) {
        *self.inner.lock().failures.entry(kind).or_default() += times;
    }

    /// Makes the broker nack the next `times` publishes sent over a channel.
    ///
    /// The publish is accepted and logged, then the confirm comes back as a
    /// nack and the message is not routed.
    pub fn nack_next_publishes(&self, times: usize) {
        self.inner.lock().nacked_publishes += times;
    }

    /// Makes every connection attempt fail until cleared.
    pub fn fail_connections(&self, fail: bool) {
        self.inner.lock().fail_connect = fail;
    }

    /// Marks every open channel closed and ends all consumer streams,
    /// as happens when the broker drops the connection.
    pub fn close_channels(&self) {
        let mut state = self.inner.lock();
        for channel in &state.channels {
            channel.store(false, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Every command received, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().operations.clone()
    }

    /// Number of commands of `kind` received.
    pub fn operation_count(&self, kind: OperationKind) -> usize {
        self.inner.lock().operations.iter().filter(|op| op.kind() == kind).count()
    }

    /// Forgets the command log.
    pub fn clear_operations(&self) {
        self.inner.lock().operations.clear();
    }

    /// Connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections
    }

    /// Channels opened so far.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Settlement totals.
    pub fn settlements(&self) -> SettlementCounts {
        self.inner.lock().settlements
    }

    /// Type of exchange `name`, if declared.
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.lock().exchanges.get(name).map(|exchange| exchange.kind)
    }

    /// Whether queue `name` exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    /// Arguments queue `name` was declared with.
    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.inner.lock().queues.get(name).map(|queue| queue.arguments.clone())
    }

    /// Number of ready messages in queue `name`.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner.lock().queues.get(name).map_or(0, |queue| queue.ready.len())
    }

    /// Ready messages in queue `name`, oldest first.
    pub fn messages(&self, name: &str) -> Vec<MockMessage> {
        self.inner.lock().queues.get(name).map_or_else(Vec::new, |queue| {
            queue.ready.iter().map(|stored| stored.message.clone()).collect()
        })
    }

    /// Number of exchanges and queues currently declared.
    pub fn entity_count(&self) -> usize {
        let state = self.inner.lock();
        state.exchanges.len() + state.queues.len()
    }

    /// Publishes without a channel, as another client would.
    ///
    /// # Errors
    ///
    /// Fails if `exchange` is named and does not exist.
    pub fn inject(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        self.inner.publish(exchange, mock_message(routing_key, message))
    }
}

fn mock_message(routing_key: &str, message: OutboundMessage) -> MockMessage {
    MockMessage {
        routing_key: routing_key.to_string(),
        body: message.body,
        headers: message.headers,
        content_type: message.content_type,
        redelivered: false,
    }
}

impl Connector for MockBroker {
    fn connect<'a>(&'a self, _uri: &'a str) -> BrokerFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            if state.fail_connect {
                return Err(BrokerError::connection("connection refused"));
            }
            state.connections += 1;
            Ok(Arc::new(MockConnection { inner: Arc::clone(&self.inner) })
                as Arc<dyn BrokerConnection>)
        })
    }
}

struct MockConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection for MockConnection {
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let open = Arc::new(AtomicBool::new(true));
            self.inner.lock().channels.push(Arc::clone(&open));
            Ok(Arc::new(MockChannel { inner: Arc::clone(&self.inner), open })
                as Arc<dyn BrokerChannel>)
        })
    }

    fn is_open(&self) -> bool {
        true
    }
}

struct MockChannel {
    inner: Arc<Inner>,
    open: Arc<AtomicBool>,
}

impl MockChannel {
    /// Locks state and records `operation`, failing on closed channels and
    /// injected failures.
    fn begin(&self, operation: Operation) -> Result<MutexGuard<'_, State>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::channel("channel closed"));
        }
        let mut state = self.inner.lock();
        state.record(operation)?;
        Ok(state)
    }
}

fn not_found(operation: &'static str, target: &str) -> BrokerError {
    BrokerError::operation(operation, target, "NOT_FOUND")
}

impl BrokerChannel for MockChannel {
    fn declare_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state =
                self.begin(Operation::DeclareExchange { name: name.to_string(), kind })?;
            match state.exchanges.get(name) {
                Some(existing) if existing.kind != kind => Err(BrokerError::operation(
                    "exchange_declare",
                    name,
                    format!("PRECONDITION_FAILED - declared as {}", existing.kind),
                )),
                Some(_) => Ok(()),
                None => {
                    state
                        .exchanges
                        .insert(name.to_string(), Exchange { kind, bindings: Vec::new() });
                    Ok(())
                },
            }
        })
    }

    fn declare_queue<'a>(
        &'a self,
        name: &'a str,
        arguments: FieldTable,
    ) -> BrokerFuture<'a, u32> {
        Box::pin(async move {
            let mut state = self.begin(Operation::DeclareQueue { name: name.to_string() })?;
            if let Some(existing) = state.queues.get(name) {
                if existing.arguments != arguments {
                    return Err(BrokerError::operation(
                        "queue_declare",
                        name,
                        "PRECONDITION_FAILED - inequivalent arguments",
                    ));
                }
                return Ok(u32::try_from(existing.ready.len()).unwrap_or(u32::MAX));
            }
            state.queues.insert(name.to_string(), Queue::new(arguments)?);
            Ok(0)
        })
    }

    fn inspect_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, u32> {
        Box::pin(async move {
            let state = self.begin(Operation::InspectQueue { name: name.to_string() })?;
            let queue = state.queues.get(name).ok_or_else(|| not_found("queue_inspect", name))?;
            Ok(u32::try_from(queue.ready.len()).unwrap_or(u32::MAX))
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(Operation::BindQueue {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            })?;
            if !state.queues.contains_key(queue) {
                return Err(not_found("queue_bind", queue));
            }
            let source =
                state.exchanges.get_mut(exchange).ok_or_else(|| not_found("queue_bind", exchange))?;
            let binding =
                Binding { pattern: routing_key.to_string(), target: Target::Queue(queue.into()) };
            if !source.bindings.contains(&binding) {
                source.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn bind_exchange<'a>(
        &'a self,
        destination: &'a str,
        source: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(Operation::BindExchange {
                destination: destination.to_string(),
                source: source.to_string(),
                routing_key: routing_key.to_string(),
            })?;
            if !state.exchanges.contains_key(destination) {
                return Err(not_found("exchange_bind", destination));
            }
            let from =
                state.exchanges.get_mut(source).ok_or_else(|| not_found("exchange_bind", source))?;
            let binding = Binding {
                pattern: routing_key.to_string(),
                target: Target::Exchange(destination.into()),
            };
            if !from.bindings.contains(&binding) {
                from.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(Operation::DeleteQueue { name: name.to_string() })?;
            state.queues.remove(name);
            state.remove_bindings_to(&Target::Queue(name.to_string()));
            Ok(())
        })
    }

    fn delete_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(Operation::DeleteExchange { name: name.to_string() })?;
            state.exchanges.remove(name);
            state.remove_bindings_to(&Target::Exchange(name.to_string()));
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let nacked = {
                let mut state = self.begin(Operation::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })?;
                let nacked = state.nacked_publishes > 0;
                state.nacked_publishes = state.nacked_publishes.saturating_sub(1);
                nacked
            };
            if nacked {
                // The confirm arrives after the frame went out.
                tokio::task::yield_now().await;
                return Err(BrokerError::operation(
                    "basic_publish",
                    exchange,
                    "broker nacked the publish",
                ));
            }
            self.inner.publish(exchange, mock_message(routing_key, message))
        })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            drop(self.begin(Operation::SetPrefetch { count })?);
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let mut state = self.begin(Operation::Consume {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
            })?;
            let (sender, receiver) = mpsc::unbounded();
            let target = state.queues.get_mut(queue).ok_or_else(|| not_found("basic_consume", queue))?;
            target.consumers.push(Consumer { tag: consumer_tag.to_string(), sender });
            self.inner.dispatch(&mut state, queue);
            Ok(Box::pin(receiver) as DeliveryStream)
        })
    }

    fn cancel<'a>(&'a self, consumer_tag: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state =
                self.begin(Operation::Cancel { consumer_tag: consumer_tag.to_string() })?;
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
            }
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MockAcker {
    inner: Arc<Inner>,
    queue: String,
    stored: Stored,
}

impl Acknowledger for MockAcker {
    fn settle(self: Box<Self>, settlement: Settlement) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            let Self { inner, queue, stored } = *self;
            inner.settle(&queue, stored.message, settlement);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn channel(broker: &MockBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("amqp://mock").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    fn message(body: &'static str) -> OutboundMessage {
        OutboundMessage { body: Bytes::from_static(body.as_bytes()), ..OutboundMessage::default() }
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", FieldTable::default()).await.unwrap();

        channel.publish("", "q", message("hi")).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.messages("q")[0].body, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn redeclaring_exchange_with_other_kind_fails() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("x", ExchangeKind::Fanout).await.unwrap();

        assert!(channel.declare_exchange("x", ExchangeKind::Fanout).await.is_ok());
        assert!(channel.declare_exchange("x", ExchangeKind::Topic).await.is_err());
    }

    #[tokio::test]
    async fn binding_to_missing_exchange_fails() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", FieldTable::default()).await.unwrap();

        assert!(channel.bind_queue("q", "missing", "#").await.is_err());
    }

    #[tokio::test]
    async fn rejected_message_is_dead_lettered() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("dlx", ExchangeKind::Fanout).await.unwrap();
        channel.declare_queue("dlq", FieldTable::default()).await.unwrap();
        channel.bind_queue("dlq", "dlx", "").await.unwrap();
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::ShortString(ShortString::from("dlx")),
        );
        channel.declare_queue("q", arguments).await.unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        channel.publish("", "q", message("bad")).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.reject_discard().await.unwrap();

        assert_eq!(broker.queue_depth("dlq"), 1);
        assert_eq!(broker.settlements().discarded, 1);
    }

    #[tokio::test]
    async fn injected_failure_fails_once() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        broker.fail_next(OperationKind::DeclareQueue, 1);

        assert!(channel.declare_queue("q", FieldTable::default()).await.is_err());
        assert!(channel.declare_queue("q", FieldTable::default()).await.is_ok());
    }

    #[tokio::test]
    async fn nacked_publish_fails_without_routing() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", FieldTable::default()).await.unwrap();
        broker.nack_next_publishes(1);

        assert!(channel.publish("", "q", message("lost")).await.is_err());
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.operation_count(OperationKind::Publish), 1);

        channel.publish("", "q", message("kept")).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_swallow_messages() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", FieldTable::default()).await.unwrap();
        drop(channel.consume("q", "gone").await.unwrap());

        channel.publish("", "q", message("waiting")).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        let mut deliveries = channel.consume("q", "c2").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, Bytes::from_static(b"waiting"));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn closing_channels_ends_consumer_streams() {
        let broker = MockBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", FieldTable::default()).await.unwrap();
        let mut deliveries = channel.consume("q", "c1").await.unwrap();

        broker.close_channels();

        assert!(deliveries.next().await.is_none());
        assert!(!channel.is_open());
    }
}
