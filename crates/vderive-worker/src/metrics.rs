//! Worker metrics.

use std::time::Duration;

use metrics::{counter, histogram};
use vderive_models::DerivationType;

pub mod names {
    /// Executed jobs by kind and outcome.
    pub const JOBS_TOTAL: &str = "vderive_worker_jobs_total";

    /// Job wall time in seconds by kind.
    pub const JOB_DURATION_SECONDS: &str = "vderive_worker_job_duration_seconds";
}

pub fn record_job(kind: DerivationType, outcome: &'static str, elapsed: Duration) {
    counter!(names::JOBS_TOTAL, "kind" => kind.as_str(), "outcome" => outcome).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "kind" => kind.as_str()).record(elapsed.as_secs_f64());
}
