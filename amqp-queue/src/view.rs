//! Job snapshot persistence.
//!
//! The engine writes snapshots through the [`View`] trait on a best-effort
//! basis: a failing View is reported on the queue's event channel but never
//! changes the outcome of a delivery. [`MemoryView`] keeps snapshots in
//! process; the `amqp-queue-redis` crate provides a Redis-backed View.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, JobSnapshot, JobState};

/// Result type for View operations.
pub type ViewResult<T> = Result<T, ViewError>;

/// View errors.
#[derive(Error, Debug, Clone)]
pub enum ViewError {
    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Snapshot without an id
    #[error("Job has no id")]
    MissingId,
}

impl From<serde_json::Error> for ViewError {
    fn from(err: serde_json::Error) -> Self {
        ViewError::Serialization(err.to_string())
    }
}

/// Filter for `count`, `find` and `types`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    /// Only jobs of this type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    /// Only jobs in this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
}

impl JobQuery {
    /// Match every job
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a job type
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Restrict to a state
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Check a snapshot against this query
    pub fn matches(&self, job: &JobSnapshot) -> bool {
        self.job_type.as_ref().is_none_or(|t| *t == job.job_type)
            && self.state.is_none_or(|s| s == job.state)
    }
}

/// Paging for `find`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Results to skip
    #[serde(default)]
    pub skip: usize,
    /// Maximum results (unbounded when `None`)
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Create paging options
    pub fn new(skip: usize, limit: usize) -> Self {
        Self {
            skip,
            limit: Some(limit),
        }
    }
}

/// Persistence contract consumed by the queue.
#[async_trait]
pub trait View: Send + Sync {
    /// Store a newly saved job.
    ///
    /// Runs after the job is published, so a worker may already have stored
    /// a later state. An existing record must be kept.
    async fn create(&self, job: &JobSnapshot) -> ViewResult<()>;

    /// Store a state change.
    async fn update(&self, job: &JobSnapshot) -> ViewResult<()>;

    /// Store a progress report.
    async fn progress(&self, job: &JobSnapshot) -> ViewResult<()> {
        self.update(job).await
    }

    /// Look up a job by id.
    async fn get(&self, id: JobId) -> ViewResult<Option<JobSnapshot>>;

    /// Count matching jobs.
    async fn count(&self, query: &JobQuery) -> ViewResult<u64>;

    /// List matching jobs, oldest first.
    async fn find(&self, query: &JobQuery, options: FindOptions) -> ViewResult<Vec<JobSnapshot>>;

    /// Distinct job types among matching jobs, sorted.
    async fn types(&self, query: &JobQuery) -> ViewResult<Vec<String>>;
}

/// In-process View.
#[derive(Debug, Default)]
pub struct MemoryView {
    jobs: RwLock<HashMap<JobId, JobSnapshot>>,
}

impl MemoryView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, job: &JobSnapshot) -> ViewResult<()> {
        let id = job.id.ok_or(ViewError::MissingId)?;
        self.jobs.write().insert(id, job.clone());
        Ok(())
    }

    fn matching(&self, query: &JobQuery) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .read()
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl View for MemoryView {
    async fn create(&self, job: &JobSnapshot) -> ViewResult<()> {
        let id = job.id.ok_or(ViewError::MissingId)?;
        self.jobs.write().entry(id).or_insert_with(|| job.clone());
        Ok(())
    }

    async fn update(&self, job: &JobSnapshot) -> ViewResult<()> {
        self.store(job)
    }

    async fn get(&self, id: JobId) -> ViewResult<Option<JobSnapshot>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn count(&self, query: &JobQuery) -> ViewResult<u64> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| query.matches(job))
            .count() as u64)
    }

    async fn find(&self, query: &JobQuery, options: FindOptions) -> ViewResult<Vec<JobSnapshot>> {
        let jobs = self.matching(query).into_iter().skip(options.skip);
        Ok(match options.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    async fn types(&self, query: &JobQuery) -> ViewResult<Vec<String>> {
        let types: BTreeSet<String> = self
            .jobs
            .read()
            .values()
            .filter(|job| query.matches(job))
            .map(|job| job.job_type.clone())
            .collect();
        Ok(types.into_iter().collect())
    }
}
