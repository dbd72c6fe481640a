//! Artifact store for the video derivative orchestrator.
//!
//! This crate provides:
//! - The record repository contract and its SQLite implementation
//! - [`ArtifactStore`]: find-or-create semantics, format administration,
//!   job tracking and cancel/purge cascades

pub mod error;
pub mod repository;
pub mod scope;
pub mod sqlite;
pub mod store;

pub use error::{CatalogError, CatalogResult};
pub use repository::ArtifactRepository;
pub use scope::CleanupScope;
pub use sqlite::SqliteArtifactRepository;
pub use store::ArtifactStore;
