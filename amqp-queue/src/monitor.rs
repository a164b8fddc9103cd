//! Lifecycle event monitor.
//!
//! Each queue instance owns at most one exclusive response queue. Subscribing
//! to a job type binds it to `res.<type>` on the primary exchange, so every
//! progress/complete/error event of that type reaches every subscribed
//! instance. Events are then matched locally by job id and event name.
//!
//! One response queue per instance keeps broker topology constant in the
//! number of jobs. The cost is fan-out: a subscribed instance also receives
//! (and discards) events for same-type jobs nobody on it listens to. The
//! `events_received` / `events_dispatched` counters expose that ratio.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, DeliveryStream, QueueDeclaration};
use crate::error::{QueueError, QueueResult};
use crate::job::{JobEvent, JobId, JobSnapshot, MonitorEnvelope};
use crate::queue::QueueEvent;
use crate::topology::Topology;

/// Callback invoked with the job record carried by an event.
pub type Listener = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<JobId, Vec<(JobEvent, Listener)>>>,
    received: AtomicU64,
    dispatched: AtomicU64,
}

impl Registry {
    fn register(&self, id: JobId, event: JobEvent, listener: Listener) {
        self.listeners
            .lock()
            .entry(id)
            .or_default()
            .push((event, listener));
    }

    fn take(&self, id: JobId) -> Vec<(JobEvent, Listener)> {
        self.listeners.lock().remove(&id).unwrap_or_default()
    }

    /// Invoke the listeners of the envelope's job and event.
    fn dispatch(&self, envelope: &MonitorEnvelope) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let Some(id) = envelope.status.id else {
            return;
        };

        let matching: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            let matching: Vec<Listener> = listeners
                .get(&id)
                .map(|registered| {
                    registered
                        .iter()
                        .filter(|(event, _)| *event == envelope.evt)
                        .map(|(_, listener)| listener.clone())
                        .collect()
                })
                .unwrap_or_default();
            if envelope.evt.is_terminal() {
                listeners.remove(&id);
            }
            matching
        };

        if !matching.is_empty() {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        for listener in matching {
            listener(&envelope.status);
        }
    }
}

struct ResponseQueue {
    name: String,
    consumer_tag: String,
}

pub(crate) struct Monitor {
    registry: Arc<Registry>,
    events: broadcast::Sender<QueueEvent>,
    response: OnceCell<ResponseQueue>,
    bound: tokio::sync::Mutex<HashSet<String>>,
}

impl Monitor {
    pub(crate) fn new(events: broadcast::Sender<QueueEvent>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            events,
            response: OnceCell::new(),
            bound: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn register(&self, id: JobId, event: JobEvent, listener: Listener) {
        self.registry.register(id, event, listener);
    }

    /// Unregister every listener of `id`
    pub(crate) fn take(&self, id: JobId) -> Vec<(JobEvent, Listener)> {
        self.registry.take(id)
    }

    /// Jobs with at least one live listener
    pub(crate) fn watched_jobs(&self) -> usize {
        self.registry.listeners.lock().len()
    }

    /// Events consumed from the response queue
    pub(crate) fn events_received(&self) -> u64 {
        self.registry.received.load(Ordering::Relaxed)
    }

    /// Events that reached at least one listener
    pub(crate) fn events_dispatched(&self) -> u64 {
        self.registry.dispatched.load(Ordering::Relaxed)
    }

    /// Bind the response queue to `res.<job_type>`, creating it first if needed.
    pub(crate) async fn subscribe(
        &self,
        channel: Arc<dyn BrokerChannel>,
        topology: &Topology,
        job_type: &str,
    ) -> QueueResult<()> {
        let mut bound = self.bound.lock().await;
        if bound.contains(job_type) {
            return Ok(());
        }

        let response = self
            .response
            .get_or_try_init(|| self.start(channel.clone()))
            .await?;
        let routing_key = Topology::response_key(job_type);
        channel
            .bind_queue(&response.name, topology.exchange(), &routing_key)
            .await?;
        bound.insert(job_type.to_string());

        debug!(queue = %response.name, routing_key = %routing_key, "Response queue bound");
        Ok(())
    }

    async fn start(&self, channel: Arc<dyn BrokerChannel>) -> QueueResult<ResponseQueue> {
        let name = channel
            .declare_queue(&QueueDeclaration::server_named().exclusive().auto_delete())
            .await?;
        let consumer_tag = format!("amqp-queue-monitor-{}", Uuid::new_v4());
        let stream = channel.consume(&name, &consumer_tag, true).await?;

        tokio::spawn(run(stream, self.registry.clone(), self.events.clone()));

        debug!(queue = %name, consumer_tag = %consumer_tag, "Monitor started");
        Ok(ResponseQueue { name, consumer_tag })
    }

    /// Cancel the response queue consumer, if one was started.
    pub(crate) async fn stop(&self, channel: &dyn BrokerChannel) -> QueueResult<()> {
        match self.response.get() {
            Some(response) => channel.cancel(&response.consumer_tag).await,
            None => Ok(()),
        }
    }
}

async fn run(
    mut stream: DeliveryStream,
    registry: Arc<Registry>,
    events: broadcast::Sender<QueueEvent>,
) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(delivery) => match serde_json::from_slice::<MonitorEnvelope>(&delivery.body) {
                Ok(envelope) => registry.dispatch(&envelope),
                Err(e) => {
                    warn!(routing_key = %delivery.routing_key, error = %e, "Malformed monitor event");
                    let _ = events.send(QueueEvent::Error(QueueError::Protocol(format!(
                        "malformed monitor event on {}: {}",
                        delivery.routing_key, e
                    ))));
                }
            },
            Err(e) => {
                warn!(error = %e, "Monitor consumer failed");
                let _ = events.send(QueueEvent::Error(e));
                break;
            }
        }
    }
    debug!("Monitor stopped");
}
