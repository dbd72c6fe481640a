//! File storage for source videos and derived artifacts.
//!
//! This crate provides:
//! - The [`FileStore`] contract used by the orchestrator and the worker
//! - A local filesystem store
//! - A Cloudflare R2 (S3-compatible) store

pub mod config;
pub mod error;
pub mod local;
pub mod r2;
pub mod store;

pub use config::{StorageBackend, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use local::LocalFileStore;
pub use r2::{R2Config, R2FileStore};
pub use store::{content_type_for, FileStore, StoredFile};
