//! In-process job queue.
//!
//! Used when the orchestrator and the worker share a process, and in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use vderive_models::{JobId, JobStatus};

use crate::dispatch::{JobDispatcher, JobSource};
use crate::error::{QueueError, QueueResult};
use crate::job::{FailureDisposition, JobSpec, QueuedJob};

/// How many submissions and successful statuses are remembered.
const HISTORY: usize = 1024;

#[derive(Default)]
struct LocalState {
    pending: VecDeque<QueuedJob>,
    statuses: HashMap<JobId, JobStatus>,
    /// Successful jobs, oldest first
    succeeded: VecDeque<JobId>,
    submitted: VecDeque<(JobId, JobSpec)>,
}

impl LocalState {
    /// Store a status. Successes past [`HISTORY`] are forgotten; an unknown
    /// status blocks resubmission just as `Success` does. Failures are kept
    /// so their keys stay retryable.
    fn record(&mut self, job_id: &JobId, status: JobStatus) {
        let previous = self.statuses.insert(job_id.clone(), status);
        if status != JobStatus::Success || previous == Some(JobStatus::Success) {
            return;
        }

        self.succeeded.push_back(job_id.clone());
        while self.succeeded.len() > HISTORY {
            if let Some(old) = self.succeeded.pop_front() {
                if self.statuses.get(&old) == Some(&JobStatus::Success) {
                    self.statuses.remove(&old);
                }
            }
        }
    }

    fn remember(&mut self, job_id: &JobId, spec: &JobSpec) {
        self.submitted.push_back((job_id.clone(), spec.clone()));
        if self.submitted.len() > HISTORY {
            self.submitted.pop_front();
        }
    }
}

/// Queue held in memory. Failed jobs are not retried.
pub struct LocalQueue {
    state: Mutex<LocalState>,
    notify: Notify,
    poll_interval: Duration,
    deliveries: AtomicU64,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(100))
    }

    /// Set how long `next_jobs` waits when the queue is empty.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            notify: Notify::new(),
            poll_interval,
            deliveries: AtomicU64::new(0),
        }
    }

    /// The most recent submissions, oldest first.
    pub async fn submitted(&self) -> Vec<(JobId, JobSpec)> {
        self.state.lock().await.submitted.iter().cloned().collect()
    }

    /// Number of jobs waiting for a worker.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn take(&self, max: usize) -> Vec<QueuedJob> {
        let mut state = self.state.lock().await;
        let n = max.min(state.pending.len());
        state.pending.drain(..n).collect()
    }
}

#[async_trait]
impl JobDispatcher for LocalQueue {
    async fn submit(&self, spec: JobSpec) -> QueueResult<JobId> {
        let job_id = JobId::new();
        let delivery = self.deliveries.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock().await;
            state.record(&job_id, JobStatus::Pending);
            state.remember(&job_id, &spec);
            state.pending.push_back(QueuedJob {
                delivery_id: format!("local-{}", delivery),
                job_id: job_id.clone(),
                spec,
            });
        }
        self.notify.notify_one();

        debug!(job_id = %job_id, "Queued local job");
        Ok(job_id)
    }

    async fn cancel(&self, job_id: &JobId) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let status = state
            .statuses
            .get_mut(job_id)
            .ok_or_else(|| QueueError::job_not_found(job_id.as_str()))?;

        if status.is_terminal() {
            debug!(job_id = %job_id, status = %status, "Cancel ignored for finished job");
            return Ok(());
        }

        *status = JobStatus::Canceled;
        state.pending.retain(|job| &job.job_id != job_id);
        info!(job_id = %job_id, "Canceled local job");
        Ok(())
    }

    async fn status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
        Ok(self.state.lock().await.statuses.get(job_id).copied())
    }
}

#[async_trait]
impl JobSource for LocalQueue {
    async fn next_jobs(&self, max: usize) -> QueueResult<Vec<QueuedJob>> {
        let jobs = self.take(max).await;
        if !jobs.is_empty() {
            return Ok(jobs);
        }

        let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
        Ok(self.take(max).await)
    }

    async fn ack(&self, job: &QueuedJob) -> QueueResult<()> {
        debug!(job_id = %job.job_id, "Acknowledged local job");
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> QueueResult<FailureDisposition> {
        warn!(job_id = %job.job_id, error, "Local job failed");
        self.set_status(&job.job_id, JobStatus::Error).await?;
        Ok(FailureDisposition::DeadLettered)
    }

    async fn set_status(&self, job_id: &JobId, status: JobStatus) -> QueueResult<()> {
        self.state.lock().await.record(job_id, status);
        Ok(())
    }

    async fn job_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
        self.status(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInput;
    use chrono::Utc;
    use vderive_models::{ConvertCommand, DerivationType, FileId};

    fn spec() -> JobSpec {
        JobSpec {
            title: "[video] Analysis".into(),
            kind: DerivationType::Analysis,
            input: JobInput::new(FileId::from("src"), Some("mp4")),
            command: ConvertCommand::Analyze,
            outputs: Vec::new(),
            staging: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_submit_then_consume() {
        let queue = LocalQueue::new();
        let id = queue.submit(spec()).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), Some(JobStatus::Pending));

        let jobs = queue.next_jobs(4).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, id);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_job() {
        let queue = LocalQueue::new();
        let id = queue.submit(spec()).await.unwrap();
        queue.cancel(&id).await.unwrap();

        assert_eq!(queue.status(&id).await.unwrap(), Some(JobStatus::Canceled));
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_does_not_override_terminal_status() {
        let queue = LocalQueue::new();
        let id = queue.submit(spec()).await.unwrap();
        queue.set_status(&id, JobStatus::Success).await.unwrap();
        queue.cancel(&id).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), Some(JobStatus::Success));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let queue = LocalQueue::new();
        let id = JobId::from("nope");
        assert_eq!(queue.status(&id).await.unwrap(), None);
        assert!(matches!(queue.cancel(&id).await, Err(QueueError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_queue_waits_then_returns_nothing() {
        let queue = LocalQueue::with_poll_interval(Duration::from_millis(5));
        assert!(queue.next_jobs(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_marks_error() {
        let queue = LocalQueue::new();
        let id = queue.submit(spec()).await.unwrap();
        let job = queue.next_jobs(1).await.unwrap().remove(0);

        let disposition = queue.fail(&job, "boom").await.unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered);
        tokio_test::assert_ok!(queue.ack(&job).await);
        assert_eq!(queue.status(&id).await.unwrap(), Some(JobStatus::Error));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let queue = LocalQueue::new();
        let mut ids = Vec::new();
        for _ in 0..HISTORY + 10 {
            let id = queue.submit(spec()).await.unwrap();
            queue.set_status(&id, JobStatus::Success).await.unwrap();
            ids.push(id);
        }

        let submitted = queue.submitted().await;
        assert_eq!(submitted.len(), HISTORY);
        assert_eq!(submitted[0].0, ids[10]);

        assert_eq!(queue.status(&ids[0]).await.unwrap(), None);
        assert_eq!(queue.status(&ids[10]).await.unwrap(), Some(JobStatus::Success));
        assert_eq!(queue.state.lock().await.statuses.len(), HISTORY);
    }

    #[tokio::test]
    async fn test_failed_statuses_outlive_history() {
        let queue = LocalQueue::new();
        let failed = queue.submit(spec()).await.unwrap();
        queue.set_status(&failed, JobStatus::Error).await.unwrap();

        for _ in 0..HISTORY + 1 {
            let id = queue.submit(spec()).await.unwrap();
            queue.set_status(&id, JobStatus::Success).await.unwrap();
        }
        assert_eq!(queue.status(&failed).await.unwrap(), Some(JobStatus::Error));
    }
}
