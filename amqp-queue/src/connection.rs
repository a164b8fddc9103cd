//! Single-flight broker session for a queue instance

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerChannel, BrokerConnection, Connector, ExchangeDeclaration, QueueDeclaration,
};
use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};
use crate::topology::Topology;

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns the one connection and channel of a queue instance.
///
/// The first caller of [`assert_setup`](Self::assert_setup) connects and
/// declares the topology; concurrent callers await that same attempt. A
/// failed attempt leaves the manager empty so a later call starts over.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    broker: BrokerConfig,
    topology: Topology,
    dead_letter_ttl: Duration,
    session: OnceCell<Session>,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        broker: BrokerConfig,
        topology: Topology,
        dead_letter_ttl: Duration,
    ) -> Self {
        Self {
            connector,
            broker,
            topology,
            dead_letter_ttl,
            session: OnceCell::new(),
        }
    }

    /// Return the channel, connecting and declaring the topology on first use.
    pub(crate) async fn assert_setup(&self) -> QueueResult<Arc<dyn BrokerChannel>> {
        let session = self.session.get_or_try_init(|| self.setup()).await?;
        Ok(session.channel.clone())
    }

    /// The channel, if setup already succeeded.
    pub(crate) fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session.get().map(|s| s.channel.clone())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session
            .get()
            .is_some_and(|s| s.connection.is_connected())
    }

    async fn setup(&self) -> QueueResult<Session> {
        debug!(exchange = %self.topology.exchange(), "Setting up broker session");

        let connection = self.connector.connect(&self.broker).await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(QueueError::Connection(e.to_string()));
            }
        };

        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            let _ = connection.close().await;
            return Err(e);
        }

        info!(
            exchange = %self.topology.exchange(),
            dead_letter_exchange = %self.topology.dead_letter_exchange(),
            "Queue topology ready"
        );
        Ok(Session {
            connection,
            channel,
        })
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> QueueResult<()> {
        channel
            .declare_exchange(&ExchangeDeclaration::topic(self.topology.exchange()))
            .await?;
        channel
            .declare_exchange(&ExchangeDeclaration::topic(
                self.topology.dead_letter_exchange(),
            ))
            .await?;

        let retry = QueueDeclaration::new(self.topology.retry_queue())
            .durable()
            .with_message_ttl(self.dead_letter_ttl)
            .with_dead_letter_exchange(self.topology.exchange());
        let retry_queue = channel.declare_queue(&retry).await?;
        channel
            .bind_queue(&retry_queue, self.topology.dead_letter_exchange(), "#")
            .await?;
        Ok(())
    }

    /// Close the channel and the connection. A no-op before setup.
    pub(crate) async fn close(&self) -> QueueResult<()> {
        let Some(session) = self.session.get() else {
            return Ok(());
        };
        if let Err(e) = session.channel.close().await {
            warn!(error = %e, "Error closing channel");
        }
        session.connection.close().await
    }
}
