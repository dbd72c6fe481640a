//! Storage backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::local::LocalFileStore;
use crate::r2::{R2Config, R2FileStore};
use crate::store::FileStore;

/// Which file store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Local,
    R2,
}

impl StorageBackend {
    pub fn parse(s: &str) -> StorageResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "fs" => Ok(StorageBackend::Local),
            "r2" | "s3" => Ok(StorageBackend::R2),
            other => Err(StorageError::config_error(format!(
                "Unknown STORAGE_BACKEND '{}'",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("./data/files"),
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let defaults = Self::default();
        let backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => StorageBackend::parse(&value)?,
            Err(_) => defaults.backend,
        };

        Ok(Self {
            backend,
            root: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
        })
    }

    /// Build the configured store.
    pub async fn open(&self) -> StorageResult<Arc<dyn FileStore>> {
        match self.backend {
            StorageBackend::Local => {
                info!(root = %self.root.display(), "Using local file store");
                Ok(Arc::new(LocalFileStore::new(&self.root).await?))
            }
            StorageBackend::R2 => {
                let config = R2Config::from_env()?;
                info!(bucket = %config.bucket_name, "Using R2 file store");
                Ok(Arc::new(R2FileStore::new(config)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(StorageBackend::parse("LOCAL").unwrap(), StorageBackend::Local);
        assert_eq!(StorageBackend::parse("r2").unwrap(), StorageBackend::R2);
        assert!(StorageBackend::parse("gcs").is_err());
    }

    #[tokio::test]
    async fn test_open_local_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            root: dir.path().join("nested").join("files"),
        };
        let store = config.open().await.unwrap();
        let saved = store.save_bytes(vec![1, 2, 3], "a.bin").await.unwrap();
        assert_eq!(store.read(&saved.id).await.unwrap(), vec![1, 2, 3]);
    }
}
