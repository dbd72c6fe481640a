//! Record persistence seam.

use async_trait::async_trait;
use vderive_models::{DedupKey, FileId, FormatId, VideoArtifact, VideoFormat, VideoFrame, VideoJob};

use crate::error::CatalogResult;
use crate::scope::CleanupScope;

/// Persistent records for renditions, formats, frames and job tracking.
///
/// Every method is atomic with respect to a single record.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Find the rendition for `(source, format)` or create it with empty
    /// metadata. Concurrent callers for one key all receive the same record.
    async fn get_or_create_artifact(
        &self,
        source: &FileId,
        format: Option<&VideoFormat>,
    ) -> CatalogResult<VideoArtifact>;

    async fn find_artifact(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
    ) -> CatalogResult<Option<VideoArtifact>>;

    /// Find the rendition whose stored file is `file_id`.
    async fn find_artifact_by_file(&self, file_id: &FileId) -> CatalogResult<Option<VideoArtifact>>;

    /// Insert or replace the rendition with the same key.
    async fn save_artifact(&self, artifact: VideoArtifact) -> CatalogResult<()>;

    async fn delete_artifact(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
    ) -> CatalogResult<Option<VideoArtifact>>;

    async fn artifacts_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoArtifact>>;

    /// Insert a format; fails with `AlreadyExists` if the name is taken.
    async fn insert_format(&self, format: VideoFormat) -> CatalogResult<()>;

    async fn find_format(&self, id: &FormatId) -> CatalogResult<Option<VideoFormat>>;

    async fn find_format_by_name(&self, name: &str) -> CatalogResult<Option<VideoFormat>>;

    async fn list_formats(&self) -> CatalogResult<Vec<VideoFormat>>;

    async fn delete_format(&self, id: &FormatId) -> CatalogResult<Option<VideoFormat>>;

    /// Insert a frame, returning the one it replaced at the same index.
    async fn upsert_frame(&self, frame: VideoFrame) -> CatalogResult<Option<VideoFrame>>;

    async fn find_frame(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
        index: u64,
    ) -> CatalogResult<Option<VideoFrame>>;

    async fn find_frame_by_file(&self, file_id: &FileId) -> CatalogResult<Option<VideoFrame>>;

    async fn delete_frame(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
        index: u64,
    ) -> CatalogResult<Option<VideoFrame>>;

    /// Frames in scope, ordered by source, format and index.
    async fn frames_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoFrame>>;

    /// Store a tracking record, returning the one it replaced for the same key.
    async fn put_job(&self, job: VideoJob) -> CatalogResult<Option<VideoJob>>;

    async fn find_job(&self, key: &DedupKey) -> CatalogResult<Option<VideoJob>>;

    async fn delete_job(&self, key: &DedupKey) -> CatalogResult<Option<VideoJob>>;

    async fn jobs_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoJob>>;
}
