//! Job dispatch between the orchestrator and conversion workers.
//!
//! This crate provides:
//! - Job payloads and completion notifications
//! - The dispatcher, job source and completion sink contracts
//! - An in-process queue
//! - A Redis Streams queue with retry/DLQ and pending-job claiming

pub mod dispatch;
pub mod error;
pub mod job;
pub mod local;
pub mod queue;

pub use dispatch::{CompletionSink, JobDispatcher, JobSource};
pub use error::{QueueError, QueueResult};
pub use job::{
    CompletedOutput, FailureDisposition, JobCompletion, JobInput, JobOutput, JobSpec, QueuedJob,
    META_FILE,
};
pub use local::LocalQueue;
pub use queue::{JobQueue, QueueConfig};
