//! Job queue using Redis Streams.
//!
//! Jobs go on `stream_name`, consumed through a consumer group. Job status
//! lives in `vderive:job:<id>:status` keys; in-flight statuses carry a TTL,
//! terminal ones are kept. Completions go on a separate stream read by the
//! orchestrator's completion listener.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vderive_models::{JobId, JobStatus};

use crate::dispatch::{CompletionSink, JobDispatcher, JobSource};
use crate::error::{QueueError, QueueResult};
use crate::job::{FailureDisposition, JobCompletion, JobSpec, QueuedJob};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name for workers
    pub consumer_group: String,
    /// Stream name for completion notifications
    pub completion_stream: String,
    /// Consumer group name for completion listeners
    pub completion_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Max retries before DLQ
    pub max_retries: u32,
    /// TTL of `Pending`/`Running` status keys
    pub status_ttl: Duration,
    /// Idle time after which another consumer's unacknowledged entry is claimed
    pub claim_idle: Duration,
    /// How long a read blocks waiting for entries
    pub block: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vderive:jobs".to_string(),
            consumer_group: "vderive:workers".to_string(),
            completion_stream: "vderive:completions".to_string(),
            completion_group: "vderive:orchestrators".to_string(),
            dlq_stream_name: "vderive:dlq".to_string(),
            max_retries: 3,
            status_ttl: Duration::from_secs(7 * 24 * 3600),
            claim_idle: Duration::from_secs(300),
            block: Duration::from_millis(5000),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            completion_stream: std::env::var("QUEUE_COMPLETION_STREAM")
                .unwrap_or(defaults.completion_stream),
            completion_group: std::env::var("QUEUE_COMPLETION_GROUP")
                .unwrap_or(defaults.completion_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            status_ttl: std::env::var("QUEUE_STATUS_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.status_ttl),
            claim_idle: std::env::var("QUEUE_CLAIM_IDLE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_idle),
            block: std::env::var("WORKER_BLOCK_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.block),
        }
    }
}

fn status_key(job_id: &JobId) -> String {
    format!("vderive:job:{}:status", job_id)
}

/// TTL for a status key; terminal statuses never expire.
fn status_expiry(config: &QueueConfig, status: JobStatus) -> Option<Duration> {
    (!status.is_terminal()).then_some(config.status_ttl)
}

fn retry_key(delivery_id: &str) -> String {
    format!("vderive:retry:{}", delivery_id)
}

fn field_str(map: &std::collections::HashMap<String, redis::Value>, field: &str) -> Option<String> {
    match map.get(field) {
        Some(redis::Value::BulkString(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Some(redis::Value::SimpleString(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Redis Streams job queue.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
    consumer_name: String,
}

impl JobQueue {
    /// Create a new job queue; `consumer_name` identifies this process in
    /// consumer groups.
    pub fn new(config: QueueConfig, consumer_name: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            consumer_name: consumer_name.into(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create both consumer groups if they do not exist.
    pub async fn init(&self) -> QueueResult<()> {
        self.create_group(&self.config.stream_name, &self.config.consumer_group)
            .await?;
        self.create_group(&self.config.completion_stream, &self.config.completion_group)
            .await
    }

    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(stream, group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn write_status(&self, job_id: &JobId, status: JobStatus) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        match status_expiry(&self.config, status) {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(status_key(job_id), status.as_str(), ttl.as_secs())
                    .await?
            }
            None => conn.set::<_, _, ()>(status_key(job_id), status.as_str()).await?,
        }
        Ok(())
    }

    async fn read_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(status_key(job_id)).await?;
        Ok(raw.as_deref().and_then(JobStatus::parse))
    }

    /// Acknowledge and delete a stream entry.
    async fn ack_entry(&self, stream: &str, group: &str, message_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(stream)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    fn parse_job(&self, entry: &redis::streams::StreamId) -> Option<QueuedJob> {
        let job_id = field_str(&entry.map, "job_id")?;
        let payload = field_str(&entry.map, "job")?;
        match serde_json::from_str::<JobSpec>(&payload) {
            Ok(spec) => Some(QueuedJob {
                delivery_id: entry.id.clone(),
                job_id: JobId::from(job_id),
                spec,
            }),
            Err(e) => {
                warn!(message_id = %entry.id, "Failed to parse job payload: {}", e);
                None
            }
        }
    }

    /// Read from a consumer group. `from` is `">"` for new entries (blocking
    /// up to `block`) or `"0"` for this consumer's unacknowledged ones.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        count: usize,
        from: &str,
    ) -> QueueResult<Vec<redis::streams::StreamId>> {
        let mut conn = self.conn().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count);
        if from == ">" {
            cmd.arg("BLOCK").arg(self.config.block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(from);

        let reply: redis::streams::StreamReadReply = cmd.query_async(&mut conn).await?;
        Ok(reply.keys.into_iter().flat_map(|key| key.ids).collect())
    }

    /// Claim job entries idle longer than `min_idle`, left behind by crashed workers.
    pub async fn claim_pending(&self, min_idle: Duration, count: usize) -> QueueResult<Vec<QueuedJob>> {
        let mut conn = self.conn().await?;

        let pending: redis::streams::StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;

        if pending.count() == 0 {
            return Ok(Vec::new());
        }

        let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.consumer_name)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::new();
        for entry in &reply.claimed {
            match self.parse_job(entry) {
                Some(job) => {
                    info!(job_id = %job.job_id, "Claimed pending job");
                    jobs.push(job);
                }
                None => {
                    self.ack_entry(&self.config.stream_name, &self.config.consumer_group, &entry.id)
                        .await
                        .ok();
                }
            }
        }

        Ok(jobs)
    }

    /// Move a job to the dead letter queue.
    async fn dlq(&self, job: &QueuedJob, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&job.spec)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job_id")
            .arg(job.job_id.as_str())
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&job.delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(job).await?;
        warn!(job_id = %job.job_id, error, "Moved job to DLQ");
        Ok(())
    }

    async fn increment_retry(&self, delivery_id: &str) -> QueueResult<u32> {
        let mut conn = self.conn().await?;
        let key = retry_key(delivery_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, 86400).await?;
        Ok(count)
    }

    /// Read completion notifications, returning `(message_id, completion)` pairs.
    pub async fn consume_completions(&self, count: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
        let entries = self
            .read_group(&self.config.completion_stream, &self.config.completion_group, count, ">")
            .await?;
        Ok(self.parse_completions(entries).await)
    }

    /// Completions read earlier but never acknowledged: first this
    /// consumer's own, then those idle longer than `claim_idle` under
    /// consumers that went away.
    ///
    /// Own entries are only found again if the consumer name is stable
    /// across restarts.
    pub async fn recover_completions(&self, count: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
        let mut entries = self
            .read_group(&self.config.completion_stream, &self.config.completion_group, count, "0")
            .await?;

        if entries.len() < count {
            let mut conn = self.conn().await?;
            let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
                .arg(&self.config.completion_stream)
                .arg(&self.config.completion_group)
                .arg(&self.consumer_name)
                .arg(self.config.claim_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(count - entries.len())
                .query_async(&mut conn)
                .await?;
            let claimed: Vec<_> = reply
                .claimed
                .into_iter()
                .filter(|claimed| entries.iter().all(|e| e.id != claimed.id))
                .collect();
            entries.extend(claimed);
        }

        if !entries.is_empty() {
            info!(count = entries.len(), "Recovered unacknowledged completions");
        }
        Ok(self.parse_completions(entries).await)
    }

    async fn parse_completions(
        &self,
        entries: Vec<redis::streams::StreamId>,
    ) -> Vec<(String, JobCompletion)> {
        let mut completions = Vec::new();
        for entry in entries {
            let parsed = field_str(&entry.map, "completion")
                .and_then(|payload| serde_json::from_str::<JobCompletion>(&payload).ok());
            match parsed {
                Some(completion) => completions.push((entry.id.clone(), completion)),
                None => {
                    warn!(message_id = %entry.id, "Dropping malformed completion");
                    self.ack_completion(&entry.id).await.ok();
                }
            }
        }
        completions
    }

    pub async fn ack_completion(&self, message_id: &str) -> QueueResult<()> {
        self.ack_entry(
            &self.config.completion_stream,
            &self.config.completion_group,
            message_id,
        )
        .await
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        Ok(len)
    }
}

#[async_trait]
impl JobDispatcher for JobQueue {
    async fn submit(&self, spec: JobSpec) -> QueueResult<JobId> {
        let job_id = JobId::new();
        let payload = serde_json::to_string(&spec)?;

        // Status first so a fast worker never sees an unknown job.
        self.write_status(&job_id, JobStatus::Pending).await?;

        let mut conn = self.conn().await?;
        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job_id")
            .arg(job_id.as_str())
            .arg("job")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        info!(job_id = %job_id, message_id = %message_id, kind = %spec.kind, "Enqueued job");
        Ok(job_id)
    }

    async fn cancel(&self, job_id: &JobId) -> QueueResult<()> {
        match self.read_status(job_id).await? {
            None => Err(QueueError::job_not_found(job_id.as_str())),
            Some(status) if status.is_terminal() => {
                debug!(job_id = %job_id, status = %status, "Cancel ignored for finished job");
                Ok(())
            }
            Some(_) => {
                self.write_status(job_id, JobStatus::Canceled).await?;
                info!(job_id = %job_id, "Canceled job");
                Ok(())
            }
        }
    }

    async fn status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
        self.read_status(job_id).await
    }
}

#[async_trait]
impl JobSource for JobQueue {
    async fn next_jobs(&self, max: usize) -> QueueResult<Vec<QueuedJob>> {
        let entries = self
            .read_group(&self.config.stream_name, &self.config.consumer_group, max, ">")
            .await?;

        let mut jobs = Vec::new();
        for entry in entries {
            match self.parse_job(&entry) {
                Some(job) => {
                    debug!(job_id = %job.job_id, "Consumed job from stream");
                    jobs.push(job);
                }
                None => {
                    self.ack_entry(&self.config.stream_name, &self.config.consumer_group, &entry.id)
                        .await
                        .ok();
                }
            }
        }
        Ok(jobs)
    }

    async fn ack(&self, job: &QueuedJob) -> QueueResult<()> {
        self.ack_entry(&self.config.stream_name, &self.config.consumer_group, &job.delivery_id)
            .await?;
        debug!(job_id = %job.job_id, "Acknowledged job");
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> QueueResult<FailureDisposition> {
        let attempt = self.increment_retry(&job.delivery_id).await?;
        if attempt >= self.config.max_retries {
            self.dlq(job, error).await?;
            self.write_status(&job.job_id, JobStatus::Error).await?;
            return Ok(FailureDisposition::DeadLettered);
        }

        // Left unacknowledged; claim_pending redelivers it.
        self.write_status(&job.job_id, JobStatus::Pending).await?;
        Ok(FailureDisposition::Retrying { attempt })
    }

    async fn set_status(&self, job_id: &JobId, status: JobStatus) -> QueueResult<()> {
        self.write_status(job_id, status).await
    }

    async fn job_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
        self.read_status(job_id).await
    }
}

#[async_trait]
impl CompletionSink for JobQueue {
    async fn deliver(&self, completion: JobCompletion) -> QueueResult<()> {
        let payload = serde_json::to_string(&completion)?;
        let mut conn = self.conn().await?;

        redis::cmd("XADD")
            .arg(&self.config.completion_stream)
            .arg("*")
            .arg("job_id")
            .arg(completion.job_id.as_str())
            .arg("completion")
            .arg(&payload)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(job_id = %completion.job_id, outputs = completion.outputs.len(), "Published completion");
        Ok(())
    }
}
