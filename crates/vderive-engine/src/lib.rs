//! Derivation engine for the video derivative orchestrator.
//!
//! This crate provides:
//! - [`FileIdentityResolver`]: maps any file id to source, rendition and format
//! - [`DerivationEngine`]: deduplicated job dispatch with cascading cleanup,
//!   completion ingestion and the caller-facing operations
//! - [`CompletionListener`]: feeds completions published by remote workers
//!   into the engine

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod listener;
pub mod locks;
pub mod metrics;
pub mod operations;
pub mod planner;

#[cfg(test)]
mod testing;

pub use completion::CompletionOutcome;
pub use config::EngineConfig;
pub use engine::{CleanupReport, DerivationEngine, DerivationOutcome};
pub use error::{EngineError, EngineResult};
pub use identity::{FileIdentity, FileIdentityResolver, FormatHint};
pub use listener::{CompletionListener, CompletionStream};
pub use locks::KeyLocks;
pub use operations::VideoDataView;
pub use planner::JobPlanner;
