//! Contracts between the orchestrator, the transport and the workers.

use async_trait::async_trait;
use vderive_models::{JobId, JobStatus};

use crate::error::QueueResult;
use crate::job::{FailureDisposition, JobCompletion, JobSpec, QueuedJob};

/// Orchestrator side: submit, cancel and poll jobs.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Submit a job, returning its handle.
    async fn submit(&self, spec: JobSpec) -> QueueResult<JobId>;

    /// Request cancellation. Advisory: a job that already finished keeps
    /// its terminal status.
    async fn cancel(&self, job_id: &JobId) -> QueueResult<()>;

    /// Current status, or `None` if the dispatcher does not know the job.
    async fn status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>>;
}

/// Worker side: receive jobs and report their progress.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Wait briefly for up to `max` jobs.
    async fn next_jobs(&self, max: usize) -> QueueResult<Vec<QueuedJob>>;

    /// Mark a delivered job as handled.
    async fn ack(&self, job: &QueuedJob) -> QueueResult<()>;

    /// Record a failed attempt.
    async fn fail(&self, job: &QueuedJob, error: &str) -> QueueResult<FailureDisposition>;

    async fn set_status(&self, job_id: &JobId, status: JobStatus) -> QueueResult<()>;

    async fn job_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>>;
}

/// Receiver of completion notifications.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn deliver(&self, completion: JobCompletion) -> QueueResult<()>;
}
