//! View implementation with Redis backend.

use std::collections::BTreeSet;

use amqp_queue::{FindOptions, JobId, JobQuery, JobSnapshot, View, ViewError, ViewResult};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tracing::{debug, info, warn};

use crate::config::RedisViewConfig;
use crate::error::{RedisViewError, RedisViewResult};

/// Ids fetched per `MGET`.
const FETCH_BATCH: usize = 100;

/// Job snapshots stored in Redis.
///
/// Each snapshot is a JSON string written with `SET EX`, so jobs disappear
/// after the retention period. Sorted-set indexes ordered by creation time
/// (one global, one per type) back `find`/`count`, and a set records the job
/// types seen. Index entries whose snapshot expired are pruned on read.
#[derive(Clone)]
pub struct RedisView {
    connection: ConnectionManager,
    config: RedisViewConfig,
}

impl RedisView {
    /// Connect with the given configuration.
    pub async fn new(config: RedisViewConfig) -> RedisViewResult<Self> {
        debug!(url = %config.url, key_prefix = %config.key_prefix, "Connecting Redis view");

        let client = Client::open(config.url.as_str())
            .map_err(|e| RedisViewError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %config.key_prefix, "Redis view ready");
        Ok(Self { connection, config })
    }

    /// Configuration
    pub fn config(&self) -> &RedisViewConfig {
        &self.config
    }

    /// Write a snapshot and index it. With `keep_existing` a stored snapshot
    /// is left untouched (`SET NX`).
    async fn store(&self, job: &JobSnapshot, keep_existing: bool) -> RedisViewResult<()> {
        let id = job.id.ok_or_else(|| {
            RedisViewError::Config("cannot store a job without an id".to_string())
        })?;
        let member = id.to_string();
        let score = job
            .created_at
            .map(|created| created.timestamp_millis())
            .unwrap_or(0);
        let json = serde_json::to_string(job)?;

        let mut set = redis::cmd("SET");
        set.arg(self.config.job_key(&member))
            .arg(json)
            .arg("EX")
            .arg(self.config.retention_secs());
        if keep_existing {
            set.arg("NX");
        }

        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .add_command(set)
            .ignore()
            .zadd(self.config.index_key(), &member, score)
            .ignore()
            .zadd(self.config.type_index_key(&job.job_type), &member, score)
            .ignore()
            .sadd(self.config.types_key(), &job.job_type)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %member, job_type = %job.job_type, state = %job.state, "Job stored");
        Ok(())
    }

    async fn load(&self, id: JobId) -> RedisViewResult<Option<JobSnapshot>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.config.job_key(&id.to_string())).await?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    /// Live snapshots of the jobs a query can match, oldest first.
    async fn candidates(&self, query: &JobQuery) -> RedisViewResult<Vec<JobSnapshot>> {
        let index = match &query.job_type {
            Some(job_type) => self.config.type_index_key(job_type),
            None => self.config.index_key(),
        };

        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.zrange(&index, 0, -1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        let mut expired = Vec::new();
        for batch in ids.chunks(FETCH_BATCH) {
            let keys: Vec<String> = batch.iter().map(|id| self.config.job_key(id)).collect();
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await?;

            for (id, value) in batch.iter().zip(values) {
                match value {
                    Some(json) => {
                        let job: JobSnapshot = serde_json::from_str(&json)?;
                        if query.matches(&job) {
                            jobs.push(job);
                        }
                    }
                    None => expired.push(id.clone()),
                }
            }
        }

        if !expired.is_empty() {
            self.prune(&index, &expired).await?;
        }
        Ok(jobs)
    }

    /// Drop expired ids from the index they were read from and the global one.
    async fn prune(&self, index: &str, expired: &[String]) -> RedisViewResult<()> {
        debug!(index = %index, count = expired.len(), "Pruning expired jobs");
        let mut conn = self.connection.clone();
        let global = self.config.index_key();
        let mut pipe = redis::pipe();
        pipe.zrem(index, expired).ignore();
        if index != global {
            pipe.zrem(&global, expired).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn known_types(&self) -> RedisViewResult<BTreeSet<String>> {
        let mut conn = self.connection.clone();
        let types: Vec<String> = conn.smembers(self.config.types_key()).await?;
        Ok(types.into_iter().collect())
    }

    async fn forget_type(&self, job_type: &str) -> RedisViewResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.srem(self.config.types_key(), job_type).await?;
        Ok(())
    }

    /// Remove every key under the prefix.
    pub async fn clear(&self) -> ViewResult<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}:*", self.config.key_prefix);
        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(RedisViewError::from)?;

        if !keys.is_empty() {
            let _: () = conn.del(keys).await.map_err(RedisViewError::from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl View for RedisView {
    async fn create(&self, job: &JobSnapshot) -> ViewResult<()> {
        if job.id.is_none() {
            return Err(ViewError::MissingId);
        }
        Ok(self.store(job, true).await?)
    }

    async fn update(&self, job: &JobSnapshot) -> ViewResult<()> {
        if job.id.is_none() {
            return Err(ViewError::MissingId);
        }
        Ok(self.store(job, false).await?)
    }

    async fn get(&self, id: JobId) -> ViewResult<Option<JobSnapshot>> {
        Ok(self.load(id).await?)
    }

    async fn count(&self, query: &JobQuery) -> ViewResult<u64> {
        Ok(self.candidates(query).await?.len() as u64)
    }

    async fn find(&self, query: &JobQuery, options: FindOptions) -> ViewResult<Vec<JobSnapshot>> {
        let jobs = self.candidates(query).await?.into_iter().skip(options.skip);
        Ok(match options.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    async fn types(&self, query: &JobQuery) -> ViewResult<Vec<String>> {
        let mut known = self.known_types().await?;
        if let Some(job_type) = &query.job_type {
            known.retain(|t| t == job_type);
        }

        let mut types = Vec::new();
        for job_type in known {
            let live = self.candidates(&JobQuery::all().with_type(job_type.clone())).await?;
            if live.is_empty() {
                if let Err(e) = self.forget_type(&job_type).await {
                    warn!(job_type = %job_type, error = %e, "Failed to forget job type");
                }
                continue;
            }
            if live.iter().any(|job| query.matches(job)) {
                types.push(job_type);
            }
        }
        Ok(types)
    }
}
