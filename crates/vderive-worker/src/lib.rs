//! Conversion worker.
//!
//! Pulls dispatched jobs, runs the convert command against a local copy of
//! the input, uploads the outputs and reports a completion back to the
//! orchestrator.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod runner;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, JobOutcome};
pub use logging::JobLogger;
pub use runner::{ConvertRunner, FfmpegConvertRunner};
