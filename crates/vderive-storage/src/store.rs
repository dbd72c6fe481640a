//! The file storage contract.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vderive_models::FileId;

use crate::error::{StorageError, StorageResult};

/// A stored binary file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: FileId,
    /// Original file name, including extension
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

impl StoredFile {
    /// Lowercased extension of `name`, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// Storage of opaque binary files keyed by [`FileId`].
///
/// Identity is assigned by the store on save.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Look up a file's record.
    async fn load(&self, id: &FileId) -> StorageResult<StoredFile>;

    /// Store the file at `path` under `name`.
    async fn save(&self, path: &Path, name: &str) -> StorageResult<StoredFile>;

    /// Store raw bytes under `name`.
    async fn save_bytes(&self, data: Vec<u8>, name: &str) -> StorageResult<StoredFile>;

    /// Delete a file. Removing a missing file is `NotFound`.
    async fn remove(&self, id: &FileId) -> StorageResult<()>;

    /// Read a whole file into memory.
    async fn read(&self, id: &FileId) -> StorageResult<Vec<u8>>;

    /// Copy a file to a local path, creating parent directories.
    async fn download_to(&self, id: &FileId, dest: &Path) -> StorageResult<()>;
}

/// Reject names that would escape a file's own directory or key prefix.
pub(crate) fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Content type for a stored file name.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webm") => "video/webm",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        let file = StoredFile {
            id: FileId::from("a"),
            name: "Clip.MP4".into(),
            size: 1,
        };
        assert_eq!(file.extension().as_deref(), Some("mp4"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("meta.json"), "application/json");
        assert_eq!(content_type_for("3.png"), "image/png");
        assert_eq!(content_type_for("output.webm"), "video/webm");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("input.mp4").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
    }
}
