//! Cloudflare R2 (S3-compatible) file store.
//!
//! Objects live at `files/<file id>/<name>`.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};
use vderive_models::FileId;

use crate::error::{StorageError, StorageResult};
use crate::store::{content_type_for, validate_name, FileStore, StoredFile};

const KEY_PREFIX: &str = "files";

/// Configuration for the R2 client.
#[derive(Debug, Clone)]
pub struct R2Config {
    /// R2 endpoint URL (S3 API endpoint)
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region (usually "auto" for R2)
    pub region: String,
}

impl R2Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("R2_ENDPOINT_URL")
                .map_err(|_| StorageError::config_error("R2_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("R2_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("R2_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("R2_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("R2_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("R2_BUCKET_NAME")
                .map_err(|_| StorageError::config_error("R2_BUCKET_NAME not set"))?,
            region: std::env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
        })
    }
}

/// File store backed by an R2 bucket.
#[derive(Clone)]
pub struct R2FileStore {
    client: Client,
    bucket: String,
}

impl R2FileStore {
    pub fn new(config: R2Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(R2Config::from_env()?))
    }

    fn key_for(id: &FileId, name: &str) -> String {
        format!("{}/{}/{}", KEY_PREFIX, id, name)
    }

    fn prefix_for(id: &FileId) -> String {
        format!("{}/{}/", KEY_PREFIX, id)
    }

    async fn put(&self, id: &FileId, name: &str, body: ByteStream) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key_for(id, name))
            .body(body)
            .content_type(content_type_for(name))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }
}

#[async_trait]
impl FileStore for R2FileStore {
    async fn load(&self, id: &FileId) -> StorageResult<StoredFile> {
        validate_name(id.as_str())?;
        let prefix = Self::prefix_for(id);

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;

        let object = response
            .contents
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found(id.as_str()))?;

        let key = object.key.unwrap_or_default();
        let name = key.strip_prefix(&prefix).unwrap_or(&key).to_string();

        Ok(StoredFile {
            id: id.clone(),
            name,
            size: object.size.unwrap_or(0).max(0) as u64,
        })
    }

    async fn save(&self, path: &Path, name: &str) -> StorageResult<StoredFile> {
        validate_name(name)?;
        let id = FileId::new();
        debug!(file_id = %id, path = %path.display(), "Uploading file");

        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        self.put(&id, name, body).await?;

        info!(file_id = %id, name, size, "Uploaded file to R2");
        Ok(StoredFile {
            id,
            name: name.to_string(),
            size,
        })
    }

    async fn save_bytes(&self, data: Vec<u8>, name: &str) -> StorageResult<StoredFile> {
        validate_name(name)?;
        let id = FileId::new();
        let size = data.len() as u64;
        self.put(&id, name, ByteStream::from(data)).await?;

        debug!(file_id = %id, name, size, "Uploaded bytes to R2");
        Ok(StoredFile {
            id,
            name: name.to_string(),
            size,
        })
    }

    async fn remove(&self, id: &FileId) -> StorageResult<()> {
        let file = self.load(id).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::key_for(id, &file.name))
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;

        debug!(file_id = %id, "Deleted object");
        Ok(())
    }

    async fn read(&self, id: &FileId) -> StorageResult<Vec<u8>> {
        let file = self.load(id).await?;
        self.get(&Self::key_for(id, &file.name)).await
    }

    async fn download_to(&self, id: &FileId, dest: &Path) -> StorageResult<()> {
        let bytes = self.read(id).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::download_failed(format!("Failed to create directory: {}", e)))?;
        }

        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| StorageError::download_failed(format!("Failed to write file: {}", e)))?;

        info!(file_id = %id, dest = %dest.display(), "Downloaded file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        let id = FileId::from("abc");
        assert_eq!(R2FileStore::key_for(&id, "output.webm"), "files/abc/output.webm");
        assert_eq!(R2FileStore::prefix_for(&id), "files/abc/");
    }
}
