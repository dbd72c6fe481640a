//! The artifact store: idempotent record operations plus cancel/purge
//! cascades over the file and job collaborators.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vderive_models::{
    ArtifactKind, DedupKey, DerivationType, FileId, FormatId, JobId, NewVideoFormat, VideoArtifact,
    VideoFormat, VideoJob,
};
use vderive_queue::JobDispatcher;
use vderive_storage::FileStore;

use crate::error::{CatalogError, CatalogResult};
use crate::repository::ArtifactRepository;
use crate::scope::CleanupScope;

/// Owner of every catalog record.
#[derive(Clone)]
pub struct ArtifactStore {
    repo: Arc<dyn ArtifactRepository>,
    files: Arc<dyn FileStore>,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl ArtifactStore {
    pub fn new(
        repo: Arc<dyn ArtifactRepository>,
        files: Arc<dyn FileStore>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            repo,
            files,
            dispatcher,
        }
    }

    /// Direct access to the record repository.
    pub fn repository(&self) -> &Arc<dyn ArtifactRepository> {
        &self.repo
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    pub async fn get_or_create_artifact(
        &self,
        source: &FileId,
        format: Option<&VideoFormat>,
    ) -> CatalogResult<VideoArtifact> {
        self.repo.get_or_create_artifact(source, format).await
    }

    pub async fn find_artifact(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
    ) -> CatalogResult<Option<VideoArtifact>> {
        self.repo.find_artifact(source, format_id).await
    }

    /// Find a format by name.
    pub async fn find_format(&self, name: &str) -> CatalogResult<VideoFormat> {
        self.repo
            .find_format_by_name(name)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("Format not found: '{}'", name)))
    }

    pub async fn find_format_by_id(&self, id: &FormatId) -> CatalogResult<VideoFormat> {
        self.repo
            .find_format(id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("Format not found: {}", id)))
    }

    /// Create a format; fails with `AlreadyExists` if the name is taken.
    pub async fn create_format(&self, new: NewVideoFormat) -> CatalogResult<VideoFormat> {
        let format = new.into_format()?;
        self.repo.insert_format(format.clone()).await?;
        info!(format_id = %format.id, name = %format.name, "Created format");
        Ok(format)
    }

    pub async fn list_formats(&self) -> CatalogResult<Vec<VideoFormat>> {
        self.repo.list_formats().await
    }

    /// Record a dispatched job, replacing any previous record for its key.
    pub async fn record_job(
        &self,
        kind: DerivationType,
        file_id: &FileId,
        source: &FileId,
        format: Option<&VideoFormat>,
        job_id: JobId,
    ) -> CatalogResult<VideoJob> {
        let job = VideoJob::new(
            kind,
            file_id.clone(),
            source.clone(),
            format.map(|f| f.id.clone()),
            format.map(|f| f.name.clone()),
            job_id,
        );

        if let Some(previous) = self.repo.put_job(job.clone()).await? {
            debug!(
                key = %job.key(),
                previous = %previous.job_id,
                current = %job.job_id,
                "Replaced tracking record"
            );
        }
        Ok(job)
    }

    /// The tracking record for a key, if any.
    pub async fn find_active_job(&self, key: &DedupKey) -> CatalogResult<Option<VideoJob>> {
        self.repo.find_job(key).await
    }

    /// Cancel every tracking record in scope whose kind is in `kinds`.
    ///
    /// Dispatcher failures are logged and skipped; the record is deleted
    /// either way. Returns the affected job handles.
    pub async fn cancel_jobs(
        &self,
        scope: &CleanupScope,
        kinds: &[DerivationType],
    ) -> CatalogResult<Vec<JobId>> {
        let jobs = self.repo.jobs_in(scope).await?;
        let mut canceled = Vec::new();

        for job in jobs.into_iter().filter(|j| kinds.contains(&j.kind)) {
            if let Err(e) = self.dispatcher.cancel(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %e, "Cancel failed, dropping record anyway");
            }
            self.repo.delete_job(&job.key()).await?;
            debug!(job_id = %job.job_id, kind = %job.kind, "Canceled job");
            canceled.push(job.job_id);
        }

        if !canceled.is_empty() {
            info!(count = canceled.len(), ?scope, "Canceled jobs");
        }
        Ok(canceled)
    }

    /// Delete records of the given kinds in scope, removing their backing
    /// files best-effort. A source's own file is never removed.
    ///
    /// Returns the ids of the files that were removed.
    pub async fn purge_artifacts(
        &self,
        scope: &CleanupScope,
        kinds: &[ArtifactKind],
    ) -> CatalogResult<Vec<FileId>> {
        let mut deleted = Vec::new();

        for kind in kinds {
            match kind {
                ArtifactKind::Frame => {
                    for frame in self.repo.frames_in(scope).await? {
                        self.repo
                            .delete_frame(&frame.source_file_id, frame.format_id.as_ref(), frame.index)
                            .await?;
                        if self.remove_file(&frame.file_id).await {
                            deleted.push(frame.file_id);
                        }
                    }
                }
                ArtifactKind::File => {
                    for artifact in self.repo.artifacts_in(scope).await? {
                        self.repo
                            .delete_artifact(&artifact.source_file_id, artifact.format_id.as_ref())
                            .await?;
                        if let Some(file_id) = artifact.file_id.as_ref() {
                            if artifact.is_derivative_file(file_id) && self.remove_file(file_id).await {
                                deleted.push(file_id.clone());
                            }
                        }
                    }
                }
                ArtifactKind::Job => {
                    for job in self.repo.jobs_in(scope).await? {
                        self.repo.delete_job(&job.key()).await?;
                    }
                }
                ArtifactKind::Format => {
                    if let CleanupScope::Format { format_id } = scope {
                        self.repo.delete_format(format_id).await?;
                    }
                }
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), ?scope, "Purged artifact files");
        }
        Ok(deleted)
    }

    /// Remove a stored file, logging instead of failing. Returns whether
    /// the file was removed.
    pub async fn remove_file(&self, file_id: &FileId) -> bool {
        match self.files.remove(file_id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!(file_id = %file_id, "File already gone");
                false
            }
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Failed to remove file");
                false
            }
        }
    }
}
