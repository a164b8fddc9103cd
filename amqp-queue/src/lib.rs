//! Distributed job queue on a topic-exchange message broker.
//!
//! Provides:
//! - 📦 Typed jobs published to a durable topic exchange
//! - 👷 Per-type work queues with prefetch control
//! - 🔄 Automatic retries through dead-letter rerouting (no application timers)
//! - 📡 Progress/complete/error events observable from any process
//! - 🛑 Graceful shutdown that drains running handlers
//! - 🧪 An in-memory broker test double (feature `testing`)
//!
//! ## Topology
//!
//! ```
//! use amqp_queue::Topology;
//!
//! let topology = Topology::new("staging:", "media");
//!
//! assert_eq!(topology.exchange(), "staging:amqp-queue:media");
//! assert_eq!(topology.dead_letter_exchange(), "staging:amqp-queue:media.deadLetter");
//! assert_eq!(topology.work_queue("thumbnail"), "staging:amqp-queue:media:thumbnail");
//! ```
//!
//! ## Producing and Consuming
//!
//! With the `testing` feature a `MemoryBroker` stands in for RabbitMQ:
//!
//! ```
//! # #[cfg(feature = "testing")]
//! # mod demo {
//! use amqp_queue::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # pub async fn main() -> Result<(), QueueError> {
//! let broker = MemoryBroker::new();
//! let queue = Queue::with_connector("media", QueueConfig::default(), broker);
//!
//! queue
//!     .process("thumbnail", ProcessOptions::default().with_retry(2), |job| async move {
//!         job.progress(1, 2, "decoded").await?;
//!         job.progress(2, 2, "scaled").await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! let (done, finished) = tokio::sync::oneshot::channel();
//! let done = std::sync::Mutex::new(Some(done));
//! let job = queue.create("thumbnail", json!({ "src": "cat.png" }));
//! job.subscribe().await?;
//! job.on(JobEvent::Complete, move |status| {
//!     if let Some(done) = done.lock().unwrap().take() {
//!         let _ = done.send(status.state);
//!     }
//! });
//! job.save().await?;
//!
//! assert_eq!(finished.await.unwrap(), JobState::Complete);
//! queue.shutdown().await?;
//! # Ok(())
//! # }
//! # }
//! # #[cfg(feature = "testing")]
//! # fn main() -> Result<(), amqp_queue::QueueError> { demo::main() }
//! # #[cfg(not(feature = "testing"))]
//! # fn main() {}
//! ```
//!
//! ## RabbitMQ
//!
//! ```no_run
//! use amqp_queue::*;
//!
//! # #[cfg(feature = "rabbitmq")]
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     // AMQP_QUEUE_HOST, AMQP_QUEUE_USERNAME, ...
//!     let queue = Queue::new("media", QueueConfig::from_env());
//!
//!     let id = queue
//!         .create("thumbnail", serde_json::json!({ "src": "cat.png" }))
//!         .save()
//!         .await?;
//!     println!("queued {}", id);
//!
//!     queue.shutdown().await
//! }
//! # #[cfg(not(feature = "rabbitmq"))]
//! # fn main() {}
//! ```

pub mod broker;
pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod job;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod monitor;
pub mod queue;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
pub mod retry;
mod shutdown;
pub mod topology;
pub mod view;

pub use broker::{
    BrokerChannel, BrokerConnection, Connector, DeathRecord, Delivery, DeliveryStream,
    ExchangeDeclaration, ExchangeKind, QueueDeclaration,
};
pub use config::{BrokerConfig, ProcessOptions, QueueConfig};
pub use dispatcher::JobHandler;
pub use error::{QueueError, QueueResult};
pub use job::{Job, JobData, JobEvent, JobId, JobOptions, JobSnapshot, JobState, MonitorEnvelope};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBroker;
pub use monitor::Listener;
pub use queue::{Queue, QueueBuilder, QueueEvent};
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqConnector;
pub use retry::RetryDecision;
pub use topology::Topology;
pub use view::{FindOptions, JobQuery, MemoryView, View, ViewError, ViewResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BrokerConfig, ProcessOptions, QueueConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{Job, JobData, JobEvent, JobId, JobOptions, JobSnapshot, JobState};
    #[cfg(any(test, feature = "testing"))]
    pub use crate::memory::MemoryBroker;
    pub use crate::queue::{Queue, QueueEvent};
    #[cfg(feature = "rabbitmq")]
    pub use crate::rabbitmq::RabbitMqConnector;
    pub use crate::view::{FindOptions, JobQuery, MemoryView, View};
}
