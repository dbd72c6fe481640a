//! Engine metrics.

use metrics::counter;
use vderive_models::DerivationType;

/// Metric name constants for consistency.
pub mod names {
    /// Jobs submitted to the dispatcher, by kind.
    pub const JOBS_DISPATCHED_TOTAL: &str = "vderive_jobs_dispatched_total";

    /// Requests answered with an existing live job, by kind.
    pub const JOBS_DEDUPLICATED_TOTAL: &str = "vderive_jobs_deduplicated_total";

    /// Jobs canceled by cleanups.
    pub const JOBS_CANCELED_TOTAL: &str = "vderive_jobs_canceled_total";

    /// Completions applied to the catalog, by kind.
    pub const COMPLETIONS_INGESTED_TOTAL: &str = "vderive_completions_ingested_total";

    /// Completions dropped because their job was superseded, by kind.
    pub const COMPLETIONS_STALE_TOTAL: &str = "vderive_completions_stale_total";

    /// Derivative files removed by cleanups.
    pub const FILES_PURGED_TOTAL: &str = "vderive_files_purged_total";
}

pub fn record_dispatched(kind: DerivationType) {
    counter!(names::JOBS_DISPATCHED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_deduplicated(kind: DerivationType) {
    counter!(names::JOBS_DEDUPLICATED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_completion(kind: DerivationType, stale: bool) {
    let name = if stale {
        names::COMPLETIONS_STALE_TOTAL
    } else {
        names::COMPLETIONS_INGESTED_TOTAL
    };
    counter!(name, "kind" => kind.as_str()).increment(1);
}

/// Record the outcome of a cancel/purge pass.
pub fn record_cleanup(canceled: usize, purged: usize) {
    if canceled > 0 {
        counter!(names::JOBS_CANCELED_TOTAL).increment(canceled as u64);
    }
    if purged > 0 {
        counter!(names::FILES_PURGED_TOTAL).increment(purged as u64);
    }
}
