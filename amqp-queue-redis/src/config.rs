//! Redis view configuration.

use std::time::Duration;

use amqp_queue::Topology;

/// Redis view configuration.
#[derive(Debug, Clone)]
pub struct RedisViewConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// How long a snapshot survives after its last write
    pub retention: Duration,
}

impl RedisViewConfig {
    /// Configuration for the jobs of queue `name`.
    ///
    /// Keys live under the queue's exchange name, `amqp-queue:<name>`.
    pub fn new(url: impl Into<String>, name: &str) -> Self {
        Self::for_queue(url, "", name)
    }

    /// Configuration sharing a queue's name prefix.
    pub fn for_queue(url: impl Into<String>, prefix: &str, name: &str) -> Self {
        Self {
            url: url.into(),
            key_prefix: Topology::new(prefix, name).exchange().to_string(),
            retention: Duration::from_secs(86400), // 24 hours
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the retention time.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Retention in whole seconds, never zero.
    pub(crate) fn retention_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    pub(crate) fn job_key(&self, id: &str) -> String {
        self.key(&format!("jobs:{}", id))
    }

    /// Creation-ordered index of every job.
    pub(crate) fn index_key(&self) -> String {
        self.key("index")
    }

    /// Creation-ordered index of one job type.
    pub(crate) fn type_index_key(&self, job_type: &str) -> String {
        self.key(&format!("index:{}", job_type))
    }

    pub(crate) fn types_key(&self) -> String {
        self.key("types")
    }
}
