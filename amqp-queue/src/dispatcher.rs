//! Work-queue consumers and handler dispatch.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, Delivery, DeliveryStream, QueueDeclaration};
use crate::config::ProcessOptions;
use crate::error::{QueueError, QueueResult};
use crate::job::{DeliveryHandle, Job, JobEvent, JobSnapshot, JobState};
use crate::queue::{Persist, QueueShared};
use crate::retry::{RetryDecision, effective_limit, prior_attempts};

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> + Send + Sync>;

pub(crate) struct Dispatcher {
    shared: Arc<QueueShared>,
    channel: Arc<dyn BrokerChannel>,
    job_type: String,
    work_queue: String,
    options: ProcessOptions,
    handler: JobHandler,
}

impl Dispatcher {
    /// Declare and bind the work queue for `job_type`, then start consuming it.
    ///
    /// Returns the consumer tag once the broker has registered the consumer.
    pub(crate) async fn start(
        shared: Arc<QueueShared>,
        job_type: String,
        options: ProcessOptions,
        handler: JobHandler,
    ) -> QueueResult<String> {
        let channel = shared.assert_setup().await?;
        let work_queue = shared.topology.work_queue(&job_type);

        // Prefetch applies to consumers started afterwards on the channel.
        let setup = shared.clone();
        let _consumers = setup.consumer_setup.lock().await;
        let declaration = QueueDeclaration::new(&work_queue)
            .durable()
            .with_dead_letter_exchange(shared.topology.dead_letter_exchange());
        channel.declare_queue(&declaration).await?;
        channel
            .bind_queue(&work_queue, shared.topology.exchange(), &job_type)
            .await?;
        channel.qos(options.prefetch.unwrap_or(0)).await?;

        let consumer_tag = format!("amqp-queue-{}", Uuid::new_v4());
        let stream = channel
            .consume(&work_queue, &consumer_tag, options.no_ack)
            .await?;

        info!(
            queue = %work_queue,
            job_type = %job_type,
            consumer_tag = %consumer_tag,
            retry = options.retry,
            prefetch = ?options.prefetch,
            no_ack = options.no_ack,
            "Handler registered"
        );

        let dispatcher = Arc::new(Dispatcher {
            shared,
            channel,
            job_type,
            work_queue,
            options,
            handler,
        });
        tokio::spawn(dispatcher.run(stream));
        Ok(consumer_tag)
    }

    async fn run(self: Arc<Self>, mut stream: DeliveryStream) {
        while let Some(next) = stream.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(queue = %self.work_queue, error = %e, "Consumer failed");
                    self.shared.emit_error(e);
                    break;
                }
            };

            let snapshot = match decode(&delivery.body) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // Left unacknowledged for inspection.
                    error!(
                        queue = %self.work_queue,
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Malformed job payload"
                    );
                    self.shared.emit_error(QueueError::Protocol(format!(
                        "malformed job on {}: {}",
                        self.work_queue, e
                    )));
                    continue;
                }
            };

            let Some(id) = snapshot.id else {
                continue;
            };
            let in_flight = self.shared.coordinator.track(id);
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.handle(delivery, snapshot).await;
                drop(in_flight);
            });
        }
        debug!(queue = %self.work_queue, job_type = %self.job_type, "Consumer stopped");
    }

    async fn handle(&self, delivery: Delivery, snapshot: JobSnapshot) {
        let job = Job::from_delivery(
            self.shared.clone(),
            snapshot,
            DeliveryHandle {
                channel: self.channel.clone(),
                delivery_tag: delivery.delivery_tag,
                auto_ack: self.options.no_ack,
            },
        );
        let lightweight = job.is_lightweight();

        let active = job.update(|record| record.state = JobState::Active);
        debug!(job_id = ?active.id, job_type = %active.job_type, redelivered = delivery.redelivered, "Job received");
        if !lightweight {
            self.shared.persist(Persist::Update, &active).await;
        }

        let handler = self.handler.clone();
        let attempt = job.clone();
        let outcome = AssertUnwindSafe(async move { handler(attempt).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(QueueError::Handler(panic_message(panic))));

        match outcome {
            Ok(()) => self.complete(&job).await,
            Err(e) => self.fail(&job, &delivery, e).await,
        }
    }

    async fn complete(&self, job: &Job) {
        if !self.options.no_ack {
            if let Err(e) = job.ack().await {
                warn!(job_id = ?job.id(), error = %e, "Failed to ack job");
                self.shared.emit_error(e);
            }
        }

        let now = Utc::now();
        let snapshot = job.update(|record| {
            record.state = JobState::Complete;
            record.completed_at = Some(now);
            record.duration = record.elapsed_at(now);
        });
        info!(job_id = ?snapshot.id, job_type = %snapshot.job_type, duration_ms = ?snapshot.duration, "Job completed");

        if !snapshot.options.lightweight {
            self.announce(JobEvent::Complete, &snapshot).await;
            self.shared.persist(Persist::Update, &snapshot).await;
        }
    }

    async fn fail(&self, job: &Job, delivery: &Delivery, cause: QueueError) {
        let prior = prior_attempts(&delivery.deaths, self.shared.topology.dead_letter_exchange());
        let limit = effective_limit(self.options.retry, job.options().retry);

        match RetryDecision::decide(prior, limit, self.options.no_ack) {
            RetryDecision::Retry => {
                warn!(
                    job_id = ?job.id(),
                    job_type = %self.job_type,
                    attempt = prior + 1,
                    retry = limit,
                    error = %cause,
                    "Job failed, retrying"
                );
                job.update(|record| record.error = Some(cause.to_string()));
                if let Err(e) = job.nack(false, false).await {
                    self.shared.emit_error(e);
                }
            }
            RetryDecision::GiveUp => {
                let now = Utc::now();
                let snapshot = job.update(|record| {
                    record.state = JobState::Failed;
                    record.failed_at = Some(now);
                    record.duration = record.elapsed_at(now);
                    record.error = Some(cause.to_string());
                });
                error!(
                    job_id = ?snapshot.id,
                    job_type = %snapshot.job_type,
                    attempts = prior + 1,
                    error = %cause,
                    "Job failed"
                );

                if !snapshot.options.lightweight {
                    self.announce(JobEvent::Error, &snapshot).await;
                    self.shared.persist(Persist::Update, &snapshot).await;
                }
                if !self.options.no_ack {
                    if let Err(e) = job.ack().await {
                        self.shared.emit_error(e);
                    }
                }
            }
        }
    }

    async fn announce(&self, event: JobEvent, snapshot: &JobSnapshot) {
        if let Err(e) = self.shared.publish_event(event, snapshot).await {
            warn!(job_id = ?snapshot.id, event = ?event, error = %e, "Failed to publish job event");
            self.shared.emit_error(e);
        }
    }
}

/// Decode a work-queue payload; a job without an id is malformed.
fn decode(body: &[u8]) -> QueueResult<JobSnapshot> {
    let snapshot: JobSnapshot = serde_json::from_slice(body)?;
    if snapshot.id.is_none() {
        return Err(QueueError::Protocol("job payload has no id".to_string()));
    }
    Ok(snapshot)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(QueueError::Protocol(_))));
        assert!(matches!(
            decode(br#"{"type": "resize"}"#),
            Err(QueueError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_valid_job() {
        let body = br#"{"id":"7b0d5f1e-3b5a-4a8e-9a53-1c2d3e4f5a6b","type":"resize","state":"inactive","data":{"w":1}}"#;
        let snapshot = decode(body).unwrap();
        assert_eq!(snapshot.job_type, "resize");
        assert_eq!(snapshot.data["w"], 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "handler panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload), "handler panicked");
    }
}
