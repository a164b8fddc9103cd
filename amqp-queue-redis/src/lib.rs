//! Redis-backed job view for amqp-queue.
//!
//! Stores job snapshots with a retention TTL so that any process can look up
//! jobs by id, count them, or list them by type and state.
//!
//! ## Usage
//!
//! ```no_run
//! use amqp_queue::{MemoryBroker, Queue, QueueConfig};
//! use amqp_queue_redis::{RedisView, RedisViewConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QueueConfig::default().with_prefix("staging:");
//! let view = RedisView::new(RedisViewConfig::for_queue(
//!     "redis://localhost:6379",
//!     &config.prefix,
//!     "media",
//! ))
//! .await?;
//!
//! let queue = Queue::builder("media")
//!     .config(config)
//!     .connector(MemoryBroker::new())
//!     .view(view)
//!     .build()?;
//! # let _ = queue;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod view;

pub use config::RedisViewConfig;
pub use error::{RedisViewError, RedisViewResult};
pub use view::RedisView;
