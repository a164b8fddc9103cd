//! In-process broker with topic routing, dead-lettering and per-queue TTL.
//!
//! Every [`MemoryBroker`] clone shares the same state, so several queues
//! connected to one broker behave like several processes talking to one
//! RabbitMQ server. The broker keeps the RabbitMQ `x-death` bookkeeping, which
//! is all the retry machinery needs.
//!
//! ```
//! use amqp_queue::{MemoryBroker, Queue, QueueConfig};
//!
//! let broker = MemoryBroker::new();
//! let queue = Queue::builder("thumbnails")
//!     .config(QueueConfig::default())
//!     .connector(broker.clone())
//!     .build()?;
//! assert_eq!(queue.exchange(), "amqp-queue:thumbnails");
//! # Ok::<(), amqp_queue::QueueError>(())
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{
    BrokerChannel, BrokerConnection, Connector, DeathRecord, Delivery, DeliveryStream,
    ExchangeDeclaration, ExchangeKind, QueueDeclaration,
};
use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};

/// Shared in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` call fail with a connection error.
    pub fn fail_next_connect(&self) {
        self.state.lock().fail_next_connect = true;
    }

    /// Make the next `publish` call fail with a broker error.
    pub fn fail_next_publish(&self) {
        self.state.lock().fail_next_publish = true;
    }

    /// Number of `ack` calls accepted so far
    pub fn ack_count(&self) -> usize {
        self.state.lock().acks
    }

    /// Number of `nack` calls accepted so far
    pub fn nack_count(&self) -> usize {
        self.state.lock().nacks
    }

    /// Number of messages published through channels so far
    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }

    /// Messages waiting for delivery in a queue (0 for unknown queues)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Consumers attached to a queue (0 for unknown queues)
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Whether a queue currently exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Run `f` under the lock, then arm any TTL timers it scheduled.
    fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let (result, timers) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.timers))
        };
        for timer in timers {
            self.schedule(timer);
        }
        result
    }

    fn schedule(&self, expiry: Expiry) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(expiry.ttl).await;
            broker.with_state(|state| state.expire(&expiry.queue, expiry.seq));
        });
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, Vec<u64>>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    next_seq: u64,
    timers: Vec<Expiry>,
    fail_next_connect: bool,
    fail_next_publish: bool,
    acks: usize,
    nacks: usize,
    published: usize,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    declaration: QueueDeclaration,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

#[derive(Clone)]
struct Message {
    seq: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    deaths: Vec<DeathRecord>,
    redelivered: bool,
}

struct ConsumerState {
    tag: String,
    channel: u64,
    no_ack: bool,
    prefetch: Option<u16>,
    unacked: usize,
    sender: mpsc::UnboundedSender<QueueResult<Delivery>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.no_ack
            || match self.prefetch {
                Some(0) | None => true,
                Some(limit) => self.unacked < usize::from(limit),
            }
    }
}

struct ChannelState {
    connection: u64,
    next_tag: u64,
    prefetch: Option<u16>,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Message,
}

struct Expiry {
    queue: String,
    seq: u64,
    ttl: Duration,
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn same_arguments(a: &QueueDeclaration, b: &QueueDeclaration) -> bool {
    a.durable == b.durable
        && a.exclusive == b.exclusive
        && a.message_ttl == b.message_ttl
        && a.dead_letter_exchange == b.dead_letter_exchange
        && a.dead_letter_routing_key == b.dead_letter_routing_key
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, channel: u64) -> QueueResult<&ChannelState> {
        self.channels
            .get(&channel)
            .ok_or_else(|| QueueError::Broker(format!("channel {} is closed", channel)))
    }

    fn connect(&mut self, config: &BrokerConfig) -> QueueResult<u64> {
        if std::mem::take(&mut self.fail_next_connect) {
            return Err(QueueError::Connection(format!(
                "connection refused by {}:{}",
                config.host, config.port
            )));
        }
        let id = self.next_id();
        self.connections.insert(id, Vec::new());
        Ok(id)
    }

    fn create_channel(&mut self, connection: u64) -> QueueResult<u64> {
        if !self.connections.contains_key(&connection) {
            return Err(QueueError::Connection(format!(
                "connection {} is closed",
                connection
            )));
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            ChannelState {
                connection,
                next_tag: 0,
                prefetch: None,
                unacked: BTreeMap::new(),
            },
        );
        if let Some(channels) = self.connections.get_mut(&connection) {
            channels.push(id);
        }
        Ok(id)
    }

    fn declare_exchange(
        &mut self,
        channel: u64,
        declaration: &ExchangeDeclaration,
    ) -> QueueResult<()> {
        self.open_channel(channel)?;
        match self.exchanges.get(&declaration.name) {
            Some(existing)
                if existing.kind != declaration.kind || existing.durable != declaration.durable =>
            {
                Err(QueueError::Protocol(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                    declaration.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    declaration.name.clone(),
                    ExchangeState {
                        kind: declaration.kind,
                        durable: declaration.durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        channel: u64,
        declaration: &QueueDeclaration,
    ) -> QueueResult<String> {
        let connection = self.open_channel(channel)?.connection;
        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            declaration.name.clone()
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                return Err(QueueError::Protocol(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                )));
            }
            if !same_arguments(&existing.declaration, declaration) {
                return Err(QueueError::Protocol(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(name);
        }

        let mut declaration = declaration.clone();
        declaration.name = name.clone();
        self.queues.insert(
            name.clone(),
            QueueState {
                owner: declaration.exclusive.then_some(connection),
                declaration,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        Ok(name)
    }

    fn bind_queue(
        &mut self,
        channel: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> QueueResult<()> {
        self.open_channel(channel)?;
        if !self.queues.contains_key(queue) {
            return Err(QueueError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| QueueError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange)))?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> QueueResult<()> {
        self.open_channel(channel)?;
        if std::mem::take(&mut self.fail_next_publish) {
            return Err(QueueError::Broker(format!(
                "publish to exchange '{}' rejected",
                exchange
            )));
        }
        self.published += 1;
        self.route(
            exchange,
            routing_key,
            Message {
                seq: 0,
                exchange: String::new(),
                routing_key: String::new(),
                body: body.to_vec(),
                deaths: Vec::new(),
                redelivered: false,
            },
        )
    }

    fn route(&mut self, exchange: &str, routing_key: &str, mut message: Message) -> QueueResult<()> {
        message.exchange = exchange.to_string();
        message.routing_key = routing_key.to_string();

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let state = self.exchanges.get(exchange).ok_or_else(|| {
                QueueError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &state.bindings {
                let matched = match state.kind {
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange = exchange, routing_key = routing_key, "Message unroutable, dropped");
        }
        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, mut message: Message) {
        self.next_seq += 1;
        message.seq = self.next_seq;
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        if let Some(ttl) = state.declaration.message_ttl {
            self.timers.push(Expiry {
                queue: queue.to_string(),
                seq: message.seq,
                ttl,
            });
        }
        state.ready.push_back(message);
        self.dispatch(queue);
    }

    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            queue.cursor = (index + 1) % count;

            let Some(channel) = self.channels.get_mut(&queue.consumers[index].channel) else {
                queue.consumers.remove(index);
                queue.cursor = 0;
                continue;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let consumer = &mut queue.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                deaths: message.deaths.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                queue.consumers.remove(index);
                queue.cursor = 0;
                queue.ready.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                consumer.unacked += 1;
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    fn expire(&mut self, queue: &str, seq: u64) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = state.ready.iter().position(|m| m.seq == seq) else {
            return;
        };
        if let Some(message) = state.ready.remove(position) {
            self.dead_letter(queue, message, "expired");
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: Message, reason: &str) {
        let Some(state) = self.queues.get(queue) else {
            return;
        };
        let Some(exchange) = state.declaration.dead_letter_exchange.clone() else {
            debug!(queue = queue, reason = reason, "Message discarded without dead-letter exchange");
            return;
        };
        let routing_key = state
            .declaration
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());

        match message
            .deaths
            .iter()
            .position(|d| d.queue == queue && d.reason == reason)
        {
            Some(position) => {
                let mut record = message.deaths.remove(position);
                record.count += 1;
                message.deaths.insert(0, record);
            }
            None => message.deaths.insert(
                0,
                DeathRecord {
                    queue: queue.to_string(),
                    exchange: message.exchange.clone(),
                    reason: reason.to_string(),
                    count: 1,
                    routing_keys: vec![message.routing_key.clone()],
                },
            ),
        }
        message.redelivered = false;

        if let Err(e) = self.route(&exchange, &routing_key, message) {
            debug!(queue = queue, exchange = %exchange, error = %e, "Dead-lettered message dropped");
        }
    }

    fn release(&mut self, entry: &Unacked, channel: u64) {
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.channel == channel && c.tag == entry.consumer_tag)
            {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
        }
    }

    fn take_unacked(
        &mut self,
        channel: u64,
        delivery_tag: u64,
        multiple: bool,
    ) -> QueueResult<Vec<Unacked>> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| QueueError::Broker(format!("channel {} is closed", channel)))?;
        let tags: Vec<u64> = if multiple {
            state.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else {
            state
                .unacked
                .contains_key(&delivery_tag)
                .then_some(delivery_tag)
                .into_iter()
                .collect()
        };
        if tags.is_empty() {
            return Err(QueueError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }
        Ok(tags
            .iter()
            .filter_map(|tag| state.unacked.remove(tag))
            .collect())
    }

    fn ack(&mut self, channel: u64, delivery_tag: u64) -> QueueResult<()> {
        let entries = self.take_unacked(channel, delivery_tag, false)?;
        self.acks += 1;
        for entry in entries {
            self.release(&entry, channel);
            self.dispatch(&entry.queue);
        }
        Ok(())
    }

    fn nack(
        &mut self,
        channel: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> QueueResult<()> {
        let entries = self.take_unacked(channel, delivery_tag, multiple)?;
        self.nacks += 1;

        let mut touched: Vec<String> = Vec::new();
        if requeue {
            for entry in entries.into_iter().rev() {
                self.release(&entry, channel);
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                if !touched.contains(&entry.queue) {
                    touched.push(entry.queue);
                }
            }
        } else {
            for entry in entries {
                self.release(&entry, channel);
                self.dead_letter(&entry.queue, entry.message, "rejected");
                if !touched.contains(&entry.queue) {
                    touched.push(entry.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn qos(&mut self, channel: u64, prefetch: u16) -> QueueResult<()> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| QueueError::Broker(format!("channel {} is closed", channel)))?;
        state.prefetch = Some(prefetch);
        Ok(())
    }

    fn consume(
        &mut self,
        channel: u64,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> QueueResult<mpsc::UnboundedReceiver<QueueResult<Delivery>>> {
        let channel_state = self.open_channel(channel)?;
        let connection = channel_state.connection;
        let prefetch = channel_state.prefetch;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };
        let duplicate = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.channel == channel && c.tag == tag);
        if duplicate {
            return Err(QueueError::Protocol(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                tag
            )));
        }

        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Broker(format!("NOT_FOUND - no queue '{}'", queue)))?;
        if state.owner.is_some_and(|owner| owner != connection) {
            return Err(QueueError::Protocol(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerState {
            tag,
            channel,
            no_ack,
            prefetch,
            unacked: 0,
            sender,
        });
        self.dispatch(queue);
        Ok(receiver)
    }

    fn cancel(&mut self, channel: u64, consumer_tag: &str) -> QueueResult<()> {
        self.open_channel(channel)?;
        for queue in self.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == channel && c.tag == consumer_tag));
            if queue.cursor >= queue.consumers.len() {
                queue.cursor = 0;
            }
        }
        Ok(())
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
            queue.cursor = 0;
        }

        let mut touched: Vec<String> = Vec::new();
        for (_, entry) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let Some(channels) = self.connections.remove(&connection) else {
            return;
        };
        for channel in channels {
            self.close_channel(channel);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.queues.remove(&name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
            debug!(queue = %name, "Exclusive queue deleted");
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> QueueResult<Arc<dyn BrokerConnection>> {
        let id = self.with_state(|state| state.connect(config))?;
        debug!(connection = id, "Memory broker connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> QueueResult<Arc<dyn BrokerChannel>> {
        let id = self.broker.with_state(|state| state.create_channel(self.id))?;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker.state.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.close_connection(self.id));
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.declare_exchange(self.id, declaration))
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> QueueResult<String> {
        self.broker
            .with_state(|state| state.declare_queue(self.id, declaration))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.bind_queue(self.id, queue, exchange, routing_key))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.publish(self.id, exchange, routing_key, body))
    }

    async fn qos(&self, prefetch: u16) -> QueueResult<()> {
        self.broker.with_state(|state| state.qos(self.id, prefetch))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> QueueResult<DeliveryStream> {
        let receiver = self
            .broker
            .with_state(|state| state.consume(self.id, queue, consumer_tag, no_ack))?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn cancel(&self, consumer_tag: &str) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.cancel(self.id, consumer_tag))
    }

    async fn ack(&self, delivery_tag: u64) -> QueueResult<()> {
        self.broker.with_state(|state| state.ack(self.id, delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()> {
        self.broker
            .with_state(|state| state.nack(self.id, delivery_tag, multiple, requeue))
    }

    async fn close(&self) -> QueueResult<()> {
        self.broker.with_state(|state| state.close_channel(self.id));
        Ok(())
    }
}
