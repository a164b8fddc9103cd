//! RabbitMQ broker implementation

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, options::*,
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerChannel, BrokerConnection, Connector, DeathRecord, Delivery, DeliveryStream,
    ExchangeDeclaration, ExchangeKind, QueueDeclaration,
};
use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) through `lapin`.
#[derive(Debug, Clone, Default)]
pub struct RabbitMqConnector;

impl RabbitMqConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    async fn connect(&self, config: &BrokerConfig) -> QueueResult<Arc<dyn BrokerConnection>> {
        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connecting to RabbitMQ");

        let url = config.url();
        let connect = Connection::connect(&url, ConnectionProperties::default());
        let connection = tokio::time::timeout(config.connection_timeout, connect)
            .await
            .map_err(|_| {
                QueueError::Connection(format!(
                    "timed out after {:?} connecting to {}:{}",
                    config.connection_timeout, config.host, config.port
                ))
            })?
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!("Connected to RabbitMQ successfully");

        Ok(Arc::new(RabbitMqConnection {
            connection,
            publisher_confirms: config.publisher_confirms,
        }))
    }
}

/// An open RabbitMQ connection
pub struct RabbitMqConnection {
    connection: Connection,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    async fn create_channel(&self) -> QueueResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        Ok(Arc::new(RabbitMqChannel {
            channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> QueueResult<()> {
        info!("Closing RabbitMQ connection");
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

/// A RabbitMQ channel
pub struct RabbitMqChannel {
    channel: Channel,
    publisher_confirms: bool,
}

fn queue_arguments(declaration: &QueueDeclaration) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = declaration.message_ttl {
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(ttl.as_millis().min(i32::MAX as u128) as i32),
        );
    }
    if let Some(ref exchange) = declaration.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(ref routing_key) = declaration.dead_letter_routing_key {
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    args
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> QueueResult<()> {
        let kind = match declaration.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &declaration.name,
                kind,
                ExchangeDeclareOptions {
                    durable: declaration.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(exchange = %declaration.name, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> QueueResult<String> {
        let queue = self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    ..Default::default()
                },
                queue_arguments(declaration),
            )
            .await?;
        let name = queue.name().as_str().to_string();
        debug!(queue = %name, "Queue declared");
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> QueueResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(
            queue = queue,
            exchange = exchange,
            routing_key = routing_key,
            "Queue bound to exchange"
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> QueueResult<()> {
        let props = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await?;

        if self.publisher_confirms {
            let confirmation = confirm.await.map_err(|e| {
                QueueError::Broker(format!("Publisher confirm failed: {}", e))
            })?;
            if confirmation.is_nack() {
                return Err(QueueError::Broker(format!(
                    "broker refused message for {}/{}",
                    exchange, routing_key
                )));
            }
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> QueueResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> QueueResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = queue, consumer_tag = consumer_tag, "Consumer registered");

        let stream = consumer.map(|next| {
            next.map(|delivery| delivery_from_lapin(&delivery))
                .map_err(QueueError::from)
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> QueueResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        info!(consumer_tag = consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> QueueResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "Error closing channel");
            return Err(e.into());
        }
        Ok(())
    }
}

fn delivery_from_lapin(delivery: &lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data.clone(),
        deaths: death_records(&delivery.properties),
    }
}

/// Parse the `x-death` header; anything missing or malformed yields no history.
fn death_records(properties: &BasicProperties) -> Vec<DeathRecord> {
    let Some(headers) = properties.headers() else {
        return Vec::new();
    };
    let Some((_, AMQPValue::FieldArray(entries))) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
    else {
        return Vec::new();
    };

    entries
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => Some(death_record(table)),
            _ => None,
        })
        .collect()
}

fn death_record(table: &FieldTable) -> DeathRecord {
    let mut record = DeathRecord {
        queue: String::new(),
        exchange: String::new(),
        reason: String::new(),
        count: 1,
        routing_keys: Vec::new(),
    };

    for (key, value) in table.inner() {
        match (key.as_str(), value) {
            ("queue", value) => record.queue = amqp_string(value).unwrap_or_default(),
            ("exchange", value) => record.exchange = amqp_string(value).unwrap_or_default(),
            ("reason", value) => record.reason = amqp_string(value).unwrap_or_default(),
            ("count", value) => record.count = amqp_count(value).unwrap_or(1),
            ("routing-keys", AMQPValue::FieldArray(keys)) => {
                record.routing_keys = keys.as_slice().iter().filter_map(amqp_string).collect()
            }
            _ => {}
        }
    }
    record
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn amqp_count(value: &AMQPValue) -> Option<u64> {
    match *value {
        AMQPValue::LongLongInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(n)),
        AMQPValue::ShortInt(n) => u64::try_from(n).ok(),
        AMQPValue::ShortUInt(n) => Some(u64::from(n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;
    use std::time::Duration;

    fn death_entry(queue: &str, exchange: &str, reason: &str, count: i64) -> AMQPValue {
        let mut table = FieldTable::default();
        table.insert("queue".into(), AMQPValue::LongString(queue.into()));
        table.insert("exchange".into(), AMQPValue::LongString(exchange.into()));
        table.insert("reason".into(), AMQPValue::LongString(reason.into()));
        table.insert("count".into(), AMQPValue::LongLongInt(count));
        table.insert(
            "routing-keys".into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                "resize".into(),
            )])),
        );
        AMQPValue::FieldTable(table)
    }

    #[test]
    fn test_death_records_parsed_from_headers() {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(FieldArray::from(vec![
                death_entry("q.retry", "q.deadLetter", "expired", 2),
                death_entry("q:resize", "q", "rejected", 2),
            ])),
        );
        let props = BasicProperties::default().with_headers(headers);

        let deaths = death_records(&props);

        assert_eq!(deaths.len(), 2);
        assert_eq!(deaths[0].exchange, "q.deadLetter");
        assert_eq!(deaths[0].reason, "expired");
        assert_eq!(deaths[0].count, 2);
        assert_eq!(deaths[1].queue, "q:resize");
        assert_eq!(deaths[1].routing_keys, vec!["resize".to_string()]);
    }

    #[test]
    fn test_missing_death_header_is_empty() {
        assert!(death_records(&BasicProperties::default()).is_empty());

        let mut headers = FieldTable::default();
        headers.insert("x-death".into(), AMQPValue::LongString("garbage".into()));
        let props = BasicProperties::default().with_headers(headers);
        assert!(death_records(&props).is_empty());
    }

    #[test]
    fn test_queue_arguments() {
        let decl = QueueDeclaration::new("retry")
            .with_message_ttl(Duration::from_millis(3000))
            .with_dead_letter_exchange("primary");
        let args = queue_arguments(&decl);

        let keys: Vec<&str> = args.inner().keys().map(|k| k.as_str()).collect();
        assert!(keys.contains(&"x-message-ttl"));
        assert!(keys.contains(&"x-dead-letter-exchange"));
        assert!(!keys.contains(&"x-dead-letter-routing-key"));
    }
}
