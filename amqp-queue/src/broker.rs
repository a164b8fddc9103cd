//! Traits and wire types for topic-exchange brokers.
//!
//! The engine only talks to these traits; `rabbitmq` and `memory` provide
//! the implementations.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::config::BrokerConfig;
use crate::error::QueueResult;

/// A stream of deliveries from a consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = QueueResult<Delivery>> + Send>>;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by routing-key pattern
    Topic,
    /// Route by exact routing key
    Direct,
    /// Route to every bound queue
    Fanout,
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: ExchangeKind,
    /// Survive broker restarts
    pub durable: bool,
}

impl ExchangeDeclaration {
    /// A durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name; empty asks the broker to generate one
    pub name: String,
    /// Survive broker restarts
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,
    /// Delete when the last consumer goes away
    pub auto_delete: bool,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
}

impl QueueDeclaration {
    /// Declare a named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a queue whose name the broker picks.
    pub fn server_named() -> Self {
        Self::default()
    }

    /// Mark as durable.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Mark as exclusive.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Mark as auto-delete.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Set the per-queue message TTL.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Set the dead-letter exchange.
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Set the dead-letter routing key.
    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// One entry of the broker-maintained dead-letter history (`x-death`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from
    pub queue: String,
    /// Exchange the message had been published to before dead-lettering
    pub exchange: String,
    /// `rejected`, `expired`, `maxlen` or `delivery_limit`
    pub reason: String,
    /// How many times this queue/reason pair occurred
    pub count: u64,
    /// Routing keys the message carried
    pub routing_keys: Vec<String>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack
    pub delivery_tag: u64,
    /// Exchange the message was last published to
    pub exchange: String,
    /// Routing key the message was last published with
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Raw body
    pub body: Vec<u8>,
    /// Dead-letter history, most recent first
    pub deaths: Vec<DeathRecord>,
}

/// Trait for broker connections.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    async fn create_channel(&self) -> QueueResult<Arc<dyn BrokerChannel>>;

    /// Check if the connection is still open.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> QueueResult<()>;
}

/// Trait for broker channels.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange.
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> QueueResult<()>;

    /// Declare a queue, returning its actual name.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> QueueResult<String>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> QueueResult<()>;

    /// Publish a persistent message.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> QueueResult<()>;

    /// Limit unacknowledged deliveries for consumers started afterwards.
    async fn qos(&self, prefetch: u16) -> QueueResult<()>;

    /// Start consuming a queue.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> QueueResult<DeliveryStream>;

    /// Cancel a consumer; its stream ends once the broker confirms.
    async fn cancel(&self, consumer_tag: &str) -> QueueResult<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> QueueResult<()>;

    /// Negatively acknowledge a delivery.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()>;

    /// Close the channel.
    async fn close(&self) -> QueueResult<()>;
}

/// Opens broker connections for a queue.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect using the given settings.
    async fn connect(&self, config: &BrokerConfig) -> QueueResult<Arc<dyn BrokerConnection>>;
}
