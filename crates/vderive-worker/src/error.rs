//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Required output missing: {0}")]
    MissingOutput(String),

    #[error("Job was canceled")]
    Canceled,

    #[error("Storage error: {0}")]
    Storage(#[from] vderive_storage::StorageError),

    #[error("Media error: {0}")]
    Media(vderive_media::MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] vderive_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }
}

impl From<vderive_media::MediaError> for WorkerError {
    fn from(err: vderive_media::MediaError) -> Self {
        match err {
            vderive_media::MediaError::Cancelled => WorkerError::Canceled,
            other => WorkerError::Media(other),
        }
    }
}
