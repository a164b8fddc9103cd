//! Job definition, wire format and lifecycle operations.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::broker::BrokerChannel;
use crate::config::validate_job_type;
use crate::error::{QueueError, QueueResult};
use crate::monitor::Listener;
use crate::queue::{Persist, QueueShared};

/// Job unique identifier.
pub type JobId = Uuid;

/// Job data payload.
pub type JobData = serde_json::Value;

/// Job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Saved, waiting for a worker
    #[default]
    Inactive,
    /// A handler is running it
    Active,
    /// Handler succeeded
    Complete,
    /// Handler failed and no retries remain
    Failed,
}

impl JobState {
    /// Whether the job reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-job options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Skip persistence and lifecycle events
    #[serde(default)]
    pub lightweight: bool,
    /// Lower the retry limit of the handler that runs this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

impl JobOptions {
    /// Options for a lightweight job
    pub fn lightweight() -> Self {
        Self {
            lightweight: true,
            retry: None,
        }
    }

    /// Set the retry limit
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Lifecycle events observable through the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEvent {
    /// Progress report
    Progress,
    /// Handler succeeded
    Complete,
    /// Handler failed for the last time
    Error,
}

impl JobEvent {
    /// Complete and error end a job's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete | JobEvent::Error)
    }
}

/// Serialisable job record, the only form that crosses the wire or the View.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Assigned on save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    /// Selects the work queue and handler
    #[serde(rename = "type")]
    pub job_type: String,
    /// Set on save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when the last attempt fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Set when the handler succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds from creation to completion or failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Lifecycle state
    #[serde(default)]
    pub state: JobState,
    /// Percent done
    #[serde(default)]
    pub progress: u8,
    /// Last handler error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Job options
    #[serde(default)]
    pub options: JobOptions,
    /// Payload
    #[serde(default)]
    pub data: JobData,
}

impl JobSnapshot {
    /// Unsaved record for a job of `job_type`
    pub fn new(job_type: impl Into<String>, data: JobData) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            created_at: None,
            failed_at: None,
            completed_at: None,
            duration: None,
            state: JobState::Inactive,
            progress: 0,
            error: None,
            message: None,
            options: JobOptions::default(),
            data,
        }
    }

    /// Milliseconds elapsed since creation at `now`
    pub(crate) fn elapsed_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.created_at.map(|created| (now - created).num_milliseconds())
    }
}

/// Event published on `res.<type>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEnvelope {
    /// Event name
    pub evt: JobEvent,
    /// Job record at the time of the event
    pub status: JobSnapshot,
}

/// Broker delivery a job was received through.
pub(crate) struct DeliveryHandle {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) delivery_tag: u64,
    pub(crate) auto_ack: bool,
}

/// A unit of work.
///
/// Cloning a `Job` yields another handle to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    queue: Arc<QueueShared>,
    record: RwLock<JobSnapshot>,
    delivery: Option<DeliveryHandle>,
    acked: AtomicBool,
    pending: Mutex<Vec<(JobEvent, Listener)>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("record", &*self.inner.record.read())
            .field("delivery_tag", &self.inner.delivery.as_ref().map(|d| d.delivery_tag))
            .field("acked", &self.is_acked())
            .finish()
    }
}

impl Job {
    fn build(
        queue: Arc<QueueShared>,
        record: JobSnapshot,
        delivery: Option<DeliveryHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                queue,
                record: RwLock::new(record),
                delivery,
                acked: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn new(
        queue: Arc<QueueShared>,
        job_type: String,
        data: JobData,
        options: JobOptions,
    ) -> Self {
        let mut record = JobSnapshot::new(job_type, data);
        record.options = options;
        Self::build(queue, record, None)
    }

    pub(crate) fn from_snapshot(queue: Arc<QueueShared>, record: JobSnapshot) -> Self {
        Self::build(queue, record, None)
    }

    pub(crate) fn from_delivery(
        queue: Arc<QueueShared>,
        record: JobSnapshot,
        delivery: DeliveryHandle,
    ) -> Self {
        Self::build(queue, record, Some(delivery))
    }

    /// Id, once saved
    pub fn id(&self) -> Option<JobId> {
        self.inner.record.read().id
    }

    /// Job type
    pub fn job_type(&self) -> String {
        self.inner.record.read().job_type.clone()
    }

    /// Payload
    pub fn data(&self) -> JobData {
        self.inner.record.read().data.clone()
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.inner.record.read().state
    }

    /// Last reported progress percentage
    pub fn progress_percent(&self) -> u8 {
        self.inner.record.read().progress
    }

    /// Options
    pub fn options(&self) -> JobOptions {
        self.inner.record.read().options
    }

    /// Whether this job skips persistence and lifecycle events
    pub fn is_lightweight(&self) -> bool {
        self.inner.record.read().options.lightweight
    }

    /// Whether this delivery was acknowledged or rejected
    pub fn is_acked(&self) -> bool {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Copy of the serialisable record
    pub fn snapshot(&self) -> JobSnapshot {
        self.inner.record.read().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut JobSnapshot)) -> JobSnapshot {
        let mut record = self.inner.record.write();
        f(&mut record);
        record.clone()
    }

    /// Publish the job and record it in the View.
    ///
    /// Saving an already saved job is a no-op that returns its id. Lightweight
    /// jobs are only published.
    pub async fn save(&self) -> QueueResult<JobId> {
        if let Some(id) = self.id() {
            return Ok(id);
        }
        let queue = &self.inner.queue;
        validate_job_type(&self.job_type())?;
        let channel = queue.assert_setup().await?;

        let id = Uuid::new_v4();
        let snapshot = {
            let mut record = self.inner.record.write();
            if let Some(existing) = record.id {
                return Ok(existing);
            }
            record.id = Some(id);
            record.created_at = Some(Utc::now());
            record.state = JobState::Inactive;
            record.clone()
        };
        // Listeners go live before publishing so early events reach them.
        self.flush_listeners(id);

        let published = match serde_json::to_vec(&snapshot) {
            Ok(body) => {
                channel
                    .publish(queue.topology.exchange(), &snapshot.job_type, &body)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            self.unsave(id);
            return Err(e);
        }

        if !snapshot.options.lightweight {
            queue.persist(Persist::Create, &snapshot).await;
        }
        debug!(job_id = %id, job_type = %snapshot.job_type, "Job published");
        Ok(id)
    }

    /// Report progress as `done` out of `total`.
    ///
    /// The percentage is `floor(100 * done / total)`, capped at 100. A no-op
    /// for lightweight jobs.
    pub async fn progress(
        &self,
        done: u64,
        total: u64,
        message: impl Into<String>,
    ) -> QueueResult<()> {
        if self.is_lightweight() {
            return Ok(());
        }
        if total == 0 {
            return Err(QueueError::Config(
                "progress total must be greater than zero".to_string(),
            ));
        }
        if self.id().is_none() {
            return Err(QueueError::Protocol(
                "progress reported for a job that was never saved".to_string(),
            ));
        }

        let percent = (u128::from(done) * 100 / u128::from(total)).min(100) as u8;
        let message = message.into();
        let snapshot = self.update(|record| {
            record.progress = percent;
            record.message = Some(message);
        });

        let queue = &self.inner.queue;
        queue.publish_event(JobEvent::Progress, &snapshot).await?;
        queue.persist(Persist::Progress, &snapshot).await;
        Ok(())
    }

    /// Acknowledge the delivery this job came from.
    ///
    /// Only the first `ack` or `nack` reaches the broker.
    pub async fn ack(&self) -> QueueResult<()> {
        let Some(delivery) = self.claim_delivery() else {
            return Ok(());
        };
        delivery.channel.ack(delivery.delivery_tag).await
    }

    /// Reject the delivery this job came from.
    ///
    /// Without `requeue` the broker dead-letters the message. Only the first
    /// `ack` or `nack` reaches the broker.
    pub async fn nack(&self, requeue: bool, multiple: bool) -> QueueResult<()> {
        let Some(delivery) = self.claim_delivery() else {
            return Ok(());
        };
        delivery
            .channel
            .nack(delivery.delivery_tag, multiple, requeue)
            .await
    }

    fn claim_delivery(&self) -> Option<&DeliveryHandle> {
        let delivery = self.inner.delivery.as_ref()?;
        if delivery.auto_ack || self.inner.acked.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(delivery)
    }

    /// Register a local listener for `event`.
    ///
    /// Events only arrive once the job type is subscribed, see
    /// [`subscribe`](Self::subscribe). Listeners of a job are dropped after its
    /// terminal event. Ignored for lightweight jobs.
    pub fn on<F>(&self, event: JobEvent, handler: F) -> &Self
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        if self.is_lightweight() {
            debug!(event = ?event, "Listener ignored for lightweight job");
            return self;
        }
        let listener: Listener = Arc::new(handler);
        let mut pending = self.inner.pending.lock();
        match self.id() {
            Some(id) => self.inner.queue.monitor.register(id, event, listener),
            None => pending.push((event, listener)),
        }
        self
    }

    /// Bind this instance's response queue to the job's type.
    ///
    /// Call before [`save`](Self::save) to be sure not to miss early events.
    /// A no-op for lightweight jobs.
    pub async fn subscribe(&self) -> QueueResult<()> {
        if self.is_lightweight() {
            return Ok(());
        }
        let job_type = self.job_type();
        self.inner.queue.subscribe(&job_type).await
    }

    /// Undo the id assignment of a failed save, parking its listeners again.
    fn unsave(&self, id: JobId) {
        let mut pending = self.inner.pending.lock();
        {
            let mut record = self.inner.record.write();
            record.id = None;
            record.created_at = None;
        }
        pending.extend(self.inner.queue.monitor.take(id));
    }

    fn flush_listeners(&self, id: JobId) {
        let mut pending = self.inner.pending.lock();
        for (event, listener) in pending.drain(..) {
            self.inner.queue.monitor.register(id, event, listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_wire_format() {
        let mut snapshot = JobSnapshot::new("resize", json!({ "w": 640 }));
        snapshot.id = Some(Uuid::nil());
        snapshot.created_at = Some(
            DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        snapshot.progress = 40;

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["type"], "resize");
        assert_eq!(value["state"], "inactive");
        assert_eq!(value["progress"], 40);
        assert_eq!(value["createdAt"], "2024-05-01T12:00:00Z");
        assert_eq!(value["options"]["lightweight"], false);
        assert_eq!(value["data"]["w"], 640);
        assert!(value.get("completedAt").is_none());
        assert!(value.get("acked").is_none());
    }

    #[test]
    fn test_snapshot_decode_ignores_unknown_fields() {
        let raw = r#"{
            "id": "7b0d5f1e-3b5a-4a8e-9a53-1c2d3e4f5a6b",
            "type": "encode",
            "createdAt": "2024-05-01T12:00:00.250Z",
            "state": "active",
            "acked": true,
            "delivery": {"tag": 9},
            "data": [1, 2, 3]
        }"#;

        let snapshot: JobSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.job_type, "encode");
        assert_eq!(snapshot.state, JobState::Active);
        assert_eq!(snapshot.progress, 0);
        assert_eq!(
            snapshot.created_at.unwrap().timestamp_subsec_millis(),
            250
        );
        assert_eq!(snapshot.data, json!([1, 2, 3]));
    }

    #[test]
    fn test_monitor_envelope_format() {
        let envelope = MonitorEnvelope {
            evt: JobEvent::Complete,
            status: JobSnapshot::new("email", json!(null)),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["evt"], "complete");
        assert_eq!(value["status"]["type"], "email");
    }

    #[test]
    fn test_elapsed() {
        let mut snapshot = JobSnapshot::new("email", json!(null));
        assert_eq!(snapshot.elapsed_at(Utc::now()), None);

        let created = Utc::now();
        snapshot.created_at = Some(created);
        assert_eq!(
            snapshot.elapsed_at(created + chrono::Duration::milliseconds(1500)),
            Some(1500)
        );
    }

    #[test]
    fn test_state_and_event_helpers() {
        assert!(JobState::Complete.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobEvent::Error.is_terminal());
        assert!(!JobEvent::Progress.is_terminal());
        assert_eq!(JobState::Failed.to_string(), "failed");
    }
}
