//! Integration tests for amqp-queue, driven through the in-memory broker

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use amqp_queue::*;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> QueueConfig {
    QueueConfig::default()
        .with_dead_letter_ttl(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(50))
}

fn queue(broker: &MemoryBroker) -> Queue {
    Queue::with_connector("test", config(), broker.clone())
}

type Recorded = (JobEvent, JobSnapshot);

fn record_events(job: &Job) -> mpsc::UnboundedReceiver<Recorded> {
    let (tx, rx) = mpsc::unbounded_channel();
    for event in [JobEvent::Progress, JobEvent::Complete, JobEvent::Error] {
        let tx = tx.clone();
        job.on(event, move |status| {
            let _ = tx.send((event, status.clone()));
        });
    }
    rx
}

/// Every event up to and including the terminal one.
async fn collect(events: &mut mpsc::UnboundedReceiver<Recorded>) -> Vec<Recorded> {
    timeout(WAIT, async {
        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }
        received
    })
    .await
    .expect("timed out waiting for job events")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_error(errors: &mut broadcast::Receiver<QueueEvent>) -> QueueError {
    loop {
        match timeout(WAIT, errors.recv()).await {
            Ok(Ok(QueueEvent::Error(e))) => return e,
            Ok(Ok(QueueEvent::Closed)) => continue,
            other => panic!("no error event: {:?}", other),
        }
    }
}

fn counting<F, Fut>(
    calls: &Arc<AtomicUsize>,
    body: F,
) -> impl Fn(Job) -> Fut + Send + Sync + 'static
where
    F: Fn(Job, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    let calls = calls.clone();
    move |job| {
        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
        body(job, attempt)
    }
}

fn count_of(events: &[Recorded], event: JobEvent) -> usize {
    events.iter().filter(|(e, _)| *e == event).count()
}

#[tokio::test]
async fn test_saved_job_round_trips_through_view() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    let job = queue.create("email", json!({ "to": "ops@example.com" }));
    let id = job.save().await.unwrap();

    let stored = queue.get(id).await.unwrap().expect("job stored");
    assert_eq!(stored.id(), Some(id));
    assert_eq!(stored.job_type(), "email");
    assert_eq!(stored.data(), json!({ "to": "ops@example.com" }));
    assert_eq!(stored.state(), JobState::Inactive);
    assert!(stored.snapshot().created_at.is_some());

    assert_eq!(queue.count(&JobQuery::all().with_type("email")).await.unwrap(), 1);
    assert_eq!(queue.types(&JobQuery::all()).await.unwrap(), vec!["email".to_string()]);
    assert_eq!(
        queue
            .find(&JobQuery::all(), FindOptions::default())
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(queue.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_save_is_idempotent() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    let job = queue.create("email", json!(null));
    let first = job.save().await.unwrap();
    let second = job.save().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.published_count(), 1);
    assert_eq!(broker.queue_depth(queue.topology().retry_queue()), 0);
}

#[tokio::test]
async fn test_ack_and_nack_reach_broker_once() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    queue
        .process("once", ProcessOptions::default(), |job| async move {
            job.ack().await?;
            job.ack().await?;
            job.nack(true, false).await?;
            assert!(job.is_acked());
            Ok(())
        })
        .await
        .unwrap();

    let job = queue.create("once", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Complete), 1);
    assert_eq!(broker.ack_count(), 1);
    assert_eq!(broker.nack_count(), 0);

    // A job that never came from a delivery has nothing to acknowledge.
    let local = queue.create("once", json!({}));
    local.ack().await.unwrap();
    local.nack(false, false).await.unwrap();
    assert_eq!(broker.ack_count(), 1);
}

#[tokio::test]
async fn test_failing_handler_retries_up_to_limit() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "flaky",
            ProcessOptions::default().with_retry(2),
            counting(&calls, |_job, _attempt| async {
                Err(QueueError::handler("always fails"))
            }),
        )
        .await
        .unwrap();

    let job = queue.create("flaky", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    let id = job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Error), 1);
    assert_eq!(count_of(&received, JobEvent::Complete), 0);

    let (_, status) = &received[received.len() - 1];
    assert_eq!(status.state, JobState::Failed);
    assert!(status.failed_at.is_some());
    assert!(status.duration.is_some());
    assert_eq!(status.error.as_deref(), Some("Handler failed: always fails"));

    sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.nack_count(), 2);
    assert_eq!(broker.ack_count(), 1);
    assert_eq!(broker.queue_depth(&queue.topology().work_queue("flaky")), 0);

    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Failed);
}

#[tokio::test]
async fn test_handler_recovers_within_retry_limit() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "flaky",
            ProcessOptions::default().with_retry(3),
            counting(&calls, |_job, attempt| async move {
                if attempt <= 2 {
                    Err(QueueError::handler(format!("attempt {} failed", attempt)))
                } else {
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let job = queue.create("flaky", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    let id = job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Complete), 1);
    assert_eq!(count_of(&received, JobEvent::Error), 0);

    sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Complete);
    assert!(stored.snapshot().completed_at.is_some());
}

#[tokio::test]
async fn test_job_retry_option_lowers_registered_limit() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "flaky",
            ProcessOptions::default().with_retry(5),
            counting(&calls, |_job, _attempt| async {
                Err(QueueError::handler("nope"))
            }),
        )
        .await
        .unwrap();

    let job = queue.create_with_options("flaky", json!({}), JobOptions::default().with_retry(1));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Error), 1);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_no_ack_failure_is_terminal() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "fragile",
            ProcessOptions::default().with_retry(3).no_ack(),
            counting(&calls, |_job, _attempt| async {
                Err(QueueError::handler("broken"))
            }),
        )
        .await
        .unwrap();

    let job = queue.create("fragile", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Error), 1);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.nack_count(), 0);
}

#[tokio::test]
async fn test_panicking_handler_counts_as_failure() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    queue
        .process("explode", ProcessOptions::default(), |_job| async move {
            if true {
                panic!("kaboom");
            }
            Ok(())
        })
        .await
        .unwrap();

    let job = queue.create("explode", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    job.save().await.unwrap();

    let received = collect(&mut events).await;
    let (event, status) = &received[0];
    assert_eq!(*event, JobEvent::Error);
    assert_eq!(
        status.error.as_deref(),
        Some("Handler failed: handler panicked: kaboom")
    );
}

#[tokio::test]
async fn test_lightweight_jobs_skip_view_and_events() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "ping",
            ProcessOptions::default(),
            counting(&calls, |job, _attempt| async move {
                job.progress(1, 2, "halfway").await?;
                Ok(())
            }),
        )
        .await
        .unwrap();
    queue.subscribe("ping").await.unwrap();

    let job = queue.create_with_options("ping", json!({}), JobOptions::lightweight());
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    let id = job.save().await.unwrap();

    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    eventually(|| queue.in_flight().is_empty()).await;
    sleep(Duration::from_millis(50)).await;

    assert!(events.recv().await.is_none());
    assert!(queue.get(id).await.unwrap().is_none());
    assert_eq!(queue.count(&JobQuery::all()).await.unwrap(), 0);
    assert_eq!(broker.published_count(), 1);
    assert_eq!(broker.ack_count(), 1);
    assert_eq!(queue.monitor_stats().0, 0);
}

#[tokio::test]
async fn test_handlers_only_receive_their_type() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, String)>();

    for kind in ["alpha", "beta"] {
        let tx = tx.clone();
        queue
            .process(kind, ProcessOptions::default(), move |job| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((kind, job.job_type()));
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    for i in 0..3 {
        for kind in ["alpha", "beta"] {
            queue.create(kind, json!({ "i": i })).save().await.unwrap();
        }
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    for (handler, job_type) in &seen {
        assert_eq!(*handler, job_type.as_str());
    }
    assert_eq!(seen.iter().filter(|(h, _)| *h == "alpha").count(), 3);
    assert_eq!(seen.iter().filter(|(h, _)| *h == "beta").count(), 3);
}

#[tokio::test]
async fn test_progress_percentages() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    queue
        .process("render", ProcessOptions::default(), |job| async move {
            job.progress(2, 10, "two frames").await?;
            job.progress(9, 10, "nine frames").await?;
            Ok(())
        })
        .await
        .unwrap();

    let job = queue.create("render", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    let id = job.save().await.unwrap();

    let received = collect(&mut events).await;
    let progress: Vec<(u8, Option<String>)> = received
        .iter()
        .filter(|(e, _)| *e == JobEvent::Progress)
        .map(|(_, s)| (s.progress, s.message.clone()))
        .collect();
    assert_eq!(
        progress,
        vec![
            (20, Some("two frames".to_string())),
            (90, Some("nine frames".to_string()))
        ]
    );
    assert_eq!(received.last().map(|(e, _)| *e), Some(JobEvent::Complete));

    sleep(Duration::from_millis(50)).await;
    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.progress_percent(), 90);
    assert_eq!(queue.watched_jobs(), 0);
}

#[tokio::test]
async fn test_progress_requires_saved_job_and_positive_total() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    let job = queue.create("render", json!({}));
    assert!(matches!(
        job.progress(1, 10, "early").await,
        Err(QueueError::Protocol(_))
    ));

    let id = job.save().await.unwrap();
    assert!(matches!(
        job.progress(1, 0, "zero").await,
        Err(QueueError::Config(_))
    ));

    job.progress(3, 10, "a third").await.unwrap();
    assert_eq!(job.progress_percent(), 30);
    let stored = queue.get(id).await.unwrap().unwrap().snapshot();
    assert_eq!(stored.progress, 30);
    assert_eq!(stored.message.as_deref(), Some("a third"));

    job.progress(15, 10, "overshoot").await.unwrap();
    assert_eq!(job.progress_percent(), 100);
}

#[tokio::test]
async fn test_events_reach_other_instances() {
    let broker = MemoryBroker::new();
    let view = Arc::new(MemoryView::new());
    let worker = Queue::builder("shared")
        .config(config())
        .connector(broker.clone())
        .view_arc(view.clone())
        .build()
        .unwrap();
    let producer = Queue::builder("shared")
        .config(config())
        .connector(broker.clone())
        .view_arc(view.clone())
        .build()
        .unwrap();

    worker
        .process("encode", ProcessOptions::default(), |job| async move {
            job.progress(1, 4, "quarter").await?;
            Ok(())
        })
        .await
        .unwrap();

    let job = producer.create("encode", json!({ "file": "a.mov" }));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    let id = job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0, JobEvent::Progress);
    assert_eq!(received[0].1.progress, 25);
    assert_eq!(received[1].0, JobEvent::Complete);

    // Same-type events for jobs nobody here watches are received and dropped.
    producer.create("encode", json!({})).save().await.unwrap();
    eventually(|| producer.monitor_stats().0 >= 4).await;
    assert_eq!(producer.monitor_stats().1, 2);

    sleep(Duration::from_millis(50)).await;
    let stored = producer.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Complete);
    assert_eq!(worker.monitor_stats().0, 0);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_jobs() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let finished = Arc::new(AtomicUsize::new(0));

    let counter = finished.clone();
    queue
        .process("slow", ProcessOptions::default(), move |_job| {
            let counter = counter.clone();
            async move {
                sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    for i in 0..3 {
        queue.create("slow", json!({ "i": i })).save().await.unwrap();
    }
    eventually(|| queue.in_flight().len() == 3).await;

    let closing = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.shutdown().await })
    };
    eventually(|| queue.is_shutting_down()).await;

    let err = queue.shutdown().await.unwrap_err();
    assert!(matches!(err, QueueError::Shutdown(_)));
    assert_eq!(queue.in_flight().len(), 3);

    closing.await.unwrap().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(queue.in_flight().is_empty());
    assert_eq!(broker.ack_count(), 3);
    assert!(!queue.is_connected());
}

#[tokio::test]
async fn test_registration_refused_after_shutdown() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    queue.assert_setup().await.unwrap();
    queue.shutdown().await.unwrap();

    let err = queue
        .process("late", ProcessOptions::default(), |_job| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Shutdown(_)));
}

#[tokio::test]
async fn test_shutdown_leaves_unconsumed_jobs_queued() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    queue
        .process("idle", ProcessOptions::default().with_prefetch(1), |_job| async {
            sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await
        .unwrap();
    for _ in 0..3 {
        queue.create("idle", json!({})).save().await.unwrap();
    }
    eventually(|| queue.in_flight().len() == 1).await;

    queue.shutdown().await.unwrap();

    let work_queue = queue.topology().work_queue("idle");
    assert_eq!(broker.ack_count(), 1);
    assert_eq!(broker.queue_depth(&work_queue), 2);
    assert_eq!(broker.consumer_count(&work_queue), 0);
}

#[tokio::test]
async fn test_connection_failure_surfaces_and_recovers() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let mut errors = queue.errors();
    broker.fail_next_connect();

    let job = queue.create("email", json!({}));
    let err = job.save().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(job.id().is_none());
    assert!(next_error(&mut errors).await.is_connection_error());

    let id = job.save().await.unwrap();
    assert_eq!(job.id(), Some(id));
    assert!(queue.is_connected());
}

#[tokio::test]
async fn test_failed_publish_parks_listeners_until_next_save() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    queue
        .process("email", ProcessOptions::default(), |_job| async { Ok(()) })
        .await
        .unwrap();

    let job = queue.create("email", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);

    broker.fail_next_publish();
    let err = job.save().await.unwrap_err();
    assert!(matches!(err, QueueError::Broker(_)));
    assert!(job.id().is_none());
    assert_eq!(queue.watched_jobs(), 0);
    assert_eq!(queue.count(&JobQuery::all()).await.unwrap(), 0);

    let id = job.save().await.unwrap();
    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Complete), 1);
    assert!(received.iter().all(|(_, status)| status.id == Some(id)));
    assert_eq!(queue.count(&JobQuery::all()).await.unwrap(), 1);
    assert_eq!(queue.watched_jobs(), 0);
}

#[tokio::test]
async fn test_job_types_in_event_namespace_rejected() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);

    let err = queue
        .process("res.email", ProcessOptions::default(), |_job| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Config(_)));

    let job = queue.create("res.email", json!({}));
    assert!(matches!(job.save().await, Err(QueueError::Config(_))));
    assert!(matches!(job.subscribe().await, Err(QueueError::Config(_))));
    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn test_concurrent_registrations_each_consume() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    let (first, second) = tokio::join!(
        queue.process(
            "thumb",
            ProcessOptions::default().with_prefetch(1),
            counting(&calls, |_job, _| async { Ok(()) }),
        ),
        queue.process(
            "encode",
            ProcessOptions::default().with_prefetch(4),
            counting(&calls, |_job, _| async { Ok(()) }),
        ),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(broker.consumer_count(&queue.topology().work_queue("thumb")), 1);
    assert_eq!(broker.consumer_count(&queue.topology().work_queue("encode")), 1);

    queue.create("thumb", json!({})).save().await.unwrap();
    queue.create("encode", json!({})).save().await.unwrap();
    eventually(|| calls.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_malformed_payload_is_reported_and_left_unacked() {
    let broker = MemoryBroker::new();
    let queue = queue(&broker);
    let mut errors = queue.errors();
    let calls = Arc::new(AtomicUsize::new(0));

    queue
        .process(
            "resize",
            ProcessOptions::default(),
            counting(&calls, |_job, _attempt| async { Ok(()) }),
        )
        .await
        .unwrap();

    let connection = broker.connect(&BrokerConfig::default()).await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .publish(queue.exchange(), "resize", b"{not json")
        .await
        .unwrap();

    let err = next_error(&mut errors).await;
    assert!(matches!(err, QueueError::Protocol(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.nack_count(), 0);
    assert_eq!(broker.queue_depth(&queue.topology().work_queue("resize")), 0);
}

struct FailingView;

#[async_trait]
impl View for FailingView {
    async fn create(&self, _job: &JobSnapshot) -> ViewResult<()> {
        Err(ViewError::Storage("disk full".to_string()))
    }

    async fn update(&self, _job: &JobSnapshot) -> ViewResult<()> {
        Err(ViewError::Storage("disk full".to_string()))
    }

    async fn get(&self, _id: JobId) -> ViewResult<Option<JobSnapshot>> {
        Ok(None)
    }

    async fn count(&self, _query: &JobQuery) -> ViewResult<u64> {
        Ok(0)
    }

    async fn find(&self, _query: &JobQuery, _options: FindOptions) -> ViewResult<Vec<JobSnapshot>> {
        Ok(Vec::new())
    }

    async fn types(&self, _query: &JobQuery) -> ViewResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_view_failures_do_not_block_delivery() {
    let broker = MemoryBroker::new();
    let queue = Queue::builder("test")
        .config(config())
        .connector(broker.clone())
        .view(FailingView)
        .build()
        .unwrap();
    let mut errors = queue.errors();

    queue
        .process("email", ProcessOptions::default(), |_job| async { Ok(()) })
        .await
        .unwrap();

    let job = queue.create("email", json!({}));
    job.subscribe().await.unwrap();
    let mut events = record_events(&job);
    job.save().await.unwrap();

    let received = collect(&mut events).await;
    assert_eq!(count_of(&received, JobEvent::Complete), 1);
    assert!(matches!(
        next_error(&mut errors).await,
        QueueError::View(ViewError::Storage(_))
    ));
    assert_eq!(broker.ack_count(), 1);
}
