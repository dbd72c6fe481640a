//! Filesystem-backed file store.
//!
//! Layout: `<root>/<file id>/<name>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use vderive_models::FileId;

use crate::error::{StorageError, StorageResult};
use crate::store::{validate_name, FileStore, StoredFile};

/// File store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, id: &FileId) -> StorageResult<PathBuf> {
        validate_name(id.as_str())?;
        Ok(self.root.join(id.as_str()))
    }

    /// Path of the stored content for `id`.
    pub async fn path_of(&self, id: &FileId) -> StorageResult<PathBuf> {
        let file = self.load(id).await?;
        Ok(self.dir_for(id)?.join(file.name))
    }

    async fn allocate(&self, name: &str) -> StorageResult<(FileId, PathBuf)> {
        validate_name(name)?;
        let id = FileId::new();
        let dir = self.dir_for(&id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok((id, dir.join(name)))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn load(&self, id: &FileId) -> StorageResult<StoredFile> {
        let dir = self.dir_for(id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(id.as_str()))
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                return Ok(StoredFile {
                    id: id.clone(),
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }

        Err(StorageError::not_found(id.as_str()))
    }

    async fn save(&self, path: &Path, name: &str) -> StorageResult<StoredFile> {
        let (id, dest) = self.allocate(name).await?;
        let size = tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", path.display(), e)))?;

        info!(file_id = %id, name, size, "Stored file");
        Ok(StoredFile {
            id,
            name: name.to_string(),
            size,
        })
    }

    async fn save_bytes(&self, data: Vec<u8>, name: &str) -> StorageResult<StoredFile> {
        let (id, dest) = self.allocate(name).await?;
        let size = data.len() as u64;
        tokio::fs::write(&dest, data).await?;

        debug!(file_id = %id, name, size, "Stored bytes");
        Ok(StoredFile {
            id,
            name: name.to_string(),
            size,
        })
    }

    async fn remove(&self, id: &FileId) -> StorageResult<()> {
        let dir = self.dir_for(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(file_id = %id, "Removed file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(id.as_str()))
            }
            Err(e) => Err(StorageError::delete_failed(e.to_string())),
        }
    }

    async fn read(&self, id: &FileId) -> StorageResult<Vec<u8>> {
        let path = self.path_of(id).await?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn download_to(&self, id: &FileId, dest: &Path) -> StorageResult<()> {
        let path = self.path_of(id).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::download_failed(format!("Failed to create directory: {}", e)))?;
        }
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("files")).await.unwrap();

        let saved = store.save_bytes(b"hello".to_vec(), "greeting.txt").await.unwrap();
        assert_eq!(saved.size, 5);

        let loaded = store.load(&saved.id).await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.read(&saved.id).await.unwrap(), b"hello");

        tokio_test::assert_ok!(store.remove(&saved.id).await);
        assert!(store.load(&saved.id).await.unwrap_err().is_not_found());
        assert!(store.remove(&saved.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_from_path_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("files")).await.unwrap();

        let src = dir.path().join("clip.webm");
        tokio::fs::write(&src, vec![7u8; 32]).await.unwrap();
        let saved = store.save(&src, "clip.webm").await.unwrap();
        assert_eq!(saved.extension().as_deref(), Some("webm"));

        let dest = dir.path().join("work").join("input.webm");
        store.download_to(&saved.id, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_rejects_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path()).await.unwrap();
        let err = store.load(&FileId::from("..")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
    }
}
