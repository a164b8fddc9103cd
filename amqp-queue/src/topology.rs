//! Broker entity names for one queue.

/// Every name inside a queue namespace starts with this.
pub const NAMESPACE: &str = "amqp-queue:";

/// Routing-key prefix of lifecycle events. Job types may not start with it.
pub const RESPONSE_PREFIX: &str = "res.";

/// Names of the exchanges and queues backing one [`Queue`](crate::Queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    dead_letter_exchange: String,
    retry_queue: String,
}

impl Topology {
    /// Derive the topology for queue `name` under `prefix`.
    ///
    /// ```
    /// use amqp_queue::Topology;
    ///
    /// let topology = Topology::new("prod:", "video");
    /// assert_eq!(topology.exchange(), "prod:amqp-queue:video");
    /// assert_eq!(topology.dead_letter_exchange(), "prod:amqp-queue:video.deadLetter");
    /// assert_eq!(topology.work_queue("encode"), "prod:amqp-queue:video:encode");
    /// ```
    pub fn new(prefix: &str, name: &str) -> Self {
        let exchange = format!("{}{}{}", prefix, NAMESPACE, name);
        let dead_letter_exchange = format!("{}.deadLetter", exchange);
        let retry_queue = format!("{}:retry", dead_letter_exchange);
        Self {
            exchange,
            dead_letter_exchange,
            retry_queue,
        }
    }

    /// Primary topic exchange
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Dead-letter topic exchange
    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// TTL queue that feeds dead-lettered messages back to the primary exchange
    pub fn retry_queue(&self) -> &str {
        &self.retry_queue
    }

    /// Work queue consumed by handlers of `job_type`
    pub fn work_queue(&self, job_type: &str) -> String {
        format!("{}:{}", self.exchange, job_type)
    }

    /// Routing key lifecycle events of `job_type` are published with
    pub fn response_key(job_type: &str) -> String {
        format!("{}{}", RESPONSE_PREFIX, job_type)
    }
}
