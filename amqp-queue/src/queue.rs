//! Queue front-end.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, Connector};
use crate::config::{ProcessOptions, QueueConfig, validate_job_type};
use crate::connection::ConnectionManager;
use crate::dispatcher::{Dispatcher, JobHandler};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobEvent, JobId, JobOptions, JobSnapshot, MonitorEnvelope};
use crate::monitor::Monitor;
use crate::shutdown::ShutdownCoordinator;
use crate::topology::Topology;
use crate::view::{FindOptions, JobQuery, MemoryView, View};

const EVENT_CAPACITY: usize = 256;

/// Instance-level notifications.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Connection, protocol, broker or View failure
    Error(QueueError),
    /// Shutdown finished and the connection is closed
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Persist {
    Create,
    Update,
    Progress,
}

pub(crate) struct QueueShared {
    pub(crate) name: String,
    pub(crate) topology: Topology,
    pub(crate) config: QueueConfig,
    pub(crate) connection: ConnectionManager,
    pub(crate) view: Arc<dyn View>,
    pub(crate) monitor: Monitor,
    pub(crate) coordinator: ShutdownCoordinator,
    pub(crate) consumer_setup: tokio::sync::Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueShared {
    pub(crate) fn emit_error(&self, error: QueueError) {
        let _ = self.events.send(QueueEvent::Error(error));
    }

    /// Connect and declare topology; failures are also emitted.
    pub(crate) async fn assert_setup(&self) -> QueueResult<Arc<dyn BrokerChannel>> {
        self.connection.assert_setup().await.inspect_err(|e| {
            warn!(exchange = %self.topology.exchange(), error = %e, "Queue setup failed");
            self.emit_error(e.clone());
        })
    }

    /// Best-effort View write; failures are emitted, never returned.
    pub(crate) async fn persist(&self, op: Persist, job: &JobSnapshot) {
        let result = match op {
            Persist::Create => self.view.create(job).await,
            Persist::Update => self.view.update(job).await,
            Persist::Progress => self.view.progress(job).await,
        };
        if let Err(e) = result {
            warn!(job_id = ?job.id, op = ?op, error = %e, "Failed to persist job");
            self.emit_error(e.into());
        }
    }

    /// Publish a lifecycle event on `res.<type>`.
    pub(crate) async fn publish_event(&self, evt: JobEvent, job: &JobSnapshot) -> QueueResult<()> {
        let channel = self.assert_setup().await?;
        let envelope = MonitorEnvelope {
            evt,
            status: job.clone(),
        };
        let body = serde_json::to_vec(&envelope)?;
        channel
            .publish(
                self.topology.exchange(),
                &Topology::response_key(&job.job_type),
                &body,
            )
            .await
    }

    pub(crate) async fn subscribe(&self, job_type: &str) -> QueueResult<()> {
        validate_job_type(job_type)?;
        let channel = self.assert_setup().await?;
        self.monitor
            .subscribe(channel, &self.topology, job_type)
            .await
            .inspect_err(|e| self.emit_error(e.clone()))
    }
}

/// Builder for [`Queue`].
pub struct QueueBuilder {
    name: String,
    config: QueueConfig,
    connector: Option<Arc<dyn Connector>>,
    view: Option<Arc<dyn View>>,
}

impl QueueBuilder {
    /// Set the queue configuration
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the broker connector
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set a shared broker connector
    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the View
    pub fn view(mut self, view: impl View + 'static) -> Self {
        self.view = Some(Arc::new(view));
        self
    }

    /// Set a shared View
    pub fn view_arc(mut self, view: Arc<dyn View>) -> Self {
        self.view = Some(view);
        self
    }

    /// Build the queue. Nothing connects until the first broker operation.
    ///
    /// Without a connector the RabbitMQ connector is used. When the
    /// `rabbitmq` feature is off a connector must be supplied.
    pub fn build(mut self) -> QueueResult<Queue> {
        let connector = match self.connector.take() {
            Some(connector) => connector,
            None => default_connector()?,
        };
        Ok(self.assemble(connector))
    }

    fn assemble(self, connector: Arc<dyn Connector>) -> Queue {
        let view = self
            .view
            .unwrap_or_else(|| Arc::new(MemoryView::new()) as Arc<dyn View>);
        let topology = Topology::new(&self.config.prefix, &self.name);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let connection = ConnectionManager::new(
            connector,
            self.config.broker.clone(),
            topology.clone(),
            self.config.dead_letter_ttl,
        );

        Queue {
            shared: Arc::new(QueueShared {
                name: self.name,
                topology,
                config: self.config,
                connection,
                view,
                monitor: Monitor::new(events.clone()),
                coordinator: ShutdownCoordinator::new(),
                consumer_setup: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }
}

#[cfg(feature = "rabbitmq")]
fn default_connector() -> QueueResult<Arc<dyn Connector>> {
    Ok(Arc::new(crate::rabbitmq::RabbitMqConnector::new()))
}

#[cfg(not(feature = "rabbitmq"))]
fn default_connector() -> QueueResult<Arc<dyn Connector>> {
    Err(QueueError::Config(
        "no connector supplied and the rabbitmq feature is disabled".to_string(),
    ))
}

/// A named job queue.
///
/// Cloning a `Queue` yields another handle to the same instance: one broker
/// connection, one response queue, one shutdown.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.shared.name)
            .field("exchange", &self.shared.topology.exchange())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Queue {
    /// Create a builder for queue `name`
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            config: QueueConfig::default(),
            connector: None,
            view: None,
        }
    }

    /// Create a queue backed by RabbitMQ
    #[cfg(feature = "rabbitmq")]
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(crate::rabbitmq::RabbitMqConnector::new());
        Self::builder(name).config(config).assemble(connector)
    }

    /// Create a queue with an explicit connector
    pub fn with_connector(
        name: impl Into<String>,
        config: QueueConfig,
        connector: impl Connector + 'static,
    ) -> Self {
        Self::builder(name)
            .config(config)
            .assemble(Arc::new(connector))
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configuration
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Broker entity names
    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    /// Primary exchange name
    pub fn exchange(&self) -> &str {
        self.shared.topology.exchange()
    }

    /// Dead-letter exchange name
    pub fn dead_letter_exchange(&self) -> &str {
        self.shared.topology.dead_letter_exchange()
    }

    /// Connect and declare the exchanges and retry queue.
    ///
    /// Concurrent callers share one attempt. Other operations call this
    /// implicitly.
    pub async fn assert_setup(&self) -> QueueResult<()> {
        self.shared.assert_setup().await.map(|_| ())
    }

    /// Create an unsaved job
    pub fn create(&self, job_type: impl Into<String>, data: JobData) -> Job {
        self.create_with_options(job_type, data, JobOptions::default())
    }

    /// Create an unsaved job with options
    pub fn create_with_options(
        &self,
        job_type: impl Into<String>,
        data: JobData,
        options: JobOptions,
    ) -> Job {
        Job::new(self.shared.clone(), job_type.into(), data, options)
    }

    /// Look a job up in the View
    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let snapshot = self.shared.view.get(id).await?;
        Ok(snapshot.map(|snapshot| Job::from_snapshot(self.shared.clone(), snapshot)))
    }

    /// Count jobs in the View
    pub async fn count(&self, query: &JobQuery) -> QueueResult<u64> {
        Ok(self.shared.view.count(query).await?)
    }

    /// List jobs from the View, oldest first
    pub async fn find(&self, query: &JobQuery, options: FindOptions) -> QueueResult<Vec<Job>> {
        let snapshots = self.shared.view.find(query, options).await?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| Job::from_snapshot(self.shared.clone(), snapshot))
            .collect())
    }

    /// Job types known to the View
    pub async fn types(&self, query: &JobQuery) -> QueueResult<Vec<String>> {
        Ok(self.shared.view.types(query).await?)
    }

    /// Register a handler for `job_type`.
    ///
    /// Resolves once the broker has registered the consumer. A handler error
    /// (or panic) rejects the delivery into the retry cycle until
    /// `options.retry` retries are used up, then fails the job.
    ///
    /// ```no_run
    /// use amqp_queue::{ProcessOptions, Queue, QueueConfig, QueueError};
    ///
    /// # #[cfg(feature = "rabbitmq")]
    /// # async fn example() -> Result<(), QueueError> {
    /// let queue = Queue::new("media", QueueConfig::from_env());
    /// queue
    ///     .process("thumbnail", ProcessOptions::default().with_retry(3), |job| async move {
    ///         let frames = 10;
    ///         for done in 1..=frames {
    ///             job.progress(done, frames, "rendering").await?;
    ///         }
    ///         Ok(())
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn process<F, Fut>(
        &self,
        job_type: impl Into<String>,
        options: ProcessOptions,
        handler: F,
    ) -> QueueResult<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let job_type = job_type.into();
        validate_job_type(&job_type)?;
        let registration = self.shared.coordinator.register()?;

        let handler: JobHandler = Arc::new(
            move |job: Job| -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> {
                Box::pin(handler(job))
            },
        );
        match Dispatcher::start(self.shared.clone(), job_type, options, handler).await {
            Ok(consumer_tag) => {
                registration.activate(consumer_tag);
                Ok(())
            }
            Err(e) => {
                self.shared.emit_error(e.clone());
                Err(e)
            }
        }
    }

    /// Bind this instance's response queue to `job_type` events.
    pub async fn subscribe(&self, job_type: &str) -> QueueResult<()> {
        self.shared.subscribe(job_type).await
    }

    /// Subscribe to instance-level events
    pub fn errors(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Ids of jobs whose handlers are running
    pub fn in_flight(&self) -> Vec<JobId> {
        self.shared.coordinator.in_flight()
    }

    /// Whether the broker connection is open
    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    /// Whether `shutdown` was called
    pub fn is_shutting_down(&self) -> bool {
        self.shared.coordinator.is_shutting_down()
    }

    /// Jobs with live local listeners
    pub fn watched_jobs(&self) -> usize {
        self.shared.monitor.watched_jobs()
    }

    /// Monitor events received and events that reached a listener.
    ///
    /// The gap between the two is the fan-out cost of per-type routing.
    pub fn monitor_stats(&self) -> (u64, u64) {
        (
            self.shared.monitor.events_received(),
            self.shared.monitor.events_dispatched(),
        )
    }

    /// Stop consuming, drain running handlers and close the connection.
    ///
    /// Waits for pending `process` registrations, cancels every consumer,
    /// sleeps for the configured grace period, then waits until no job is in
    /// flight. Handlers are never aborted. Fails immediately with
    /// [`QueueError::Shutdown`] if a shutdown already started.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.shared.coordinator.begin()?;
        info!(exchange = %self.exchange(), "Shutting down queue");

        match self.drain_and_close().await {
            Ok(()) => {
                info!(exchange = %self.exchange(), "Queue closed");
                let _ = self.shared.events.send(QueueEvent::Closed);
                Ok(())
            }
            Err(e) => {
                warn!(exchange = %self.exchange(), error = %e, "Shutdown failed");
                self.shared.emit_error(e.clone());
                Err(e)
            }
        }
    }

    async fn drain_and_close(&self) -> QueueResult<()> {
        let shared = &self.shared;
        let consumers = shared.coordinator.settled_consumers().await;

        if let Some(channel) = shared.connection.channel() {
            for consumer_tag in &consumers {
                channel.cancel(consumer_tag).await?;
                debug!(consumer_tag = %consumer_tag, "Consumer cancelled");
            }
        }

        tokio::time::sleep(shared.config.shutdown_grace).await;
        shared.coordinator.drained().await;

        if let Some(channel) = shared.connection.channel() {
            shared.monitor.stop(channel.as_ref()).await?;
        }
        shared.connection.close().await
    }
}
