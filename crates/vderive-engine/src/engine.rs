//! The derivation state machine: deduplicated dispatch of analysis,
//! transcoding and frame extraction jobs, with cascading cleanup on
//! forced re-runs.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use vderive_catalog::{ArtifactStore, CleanupScope, SqliteArtifactRepository};
use vderive_models::{
    ArtifactKind, DedupKey, DerivationType, FileId, JobId, JobStatus, VideoFormat, VideoMetadata,
};
use vderive_queue::JobDispatcher;
use vderive_storage::{FileStore, StoredFile};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::identity::FileIdentityResolver;
use crate::locks::KeyLocks;
use crate::metrics;
use crate::planner::JobPlanner;

/// Result of a derivation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivationOutcome {
    /// Whether a new job was dispatched
    pub job_created: bool,
    /// The new job, or the live job that made the request a no-op
    pub job_id: Option<JobId>,
    /// Dispatcher status of the existing job, when none was created
    pub status: Option<JobStatus>,
    pub message: String,
}

impl DerivationOutcome {
    fn created(kind: DerivationType, job_id: JobId) -> Self {
        Self {
            job_created: true,
            message: format!("{} job dispatched", kind.label()),
            job_id: Some(job_id),
            status: None,
        }
    }

    fn existing(kind: DerivationType, job_id: JobId, status: Option<JobStatus>) -> Self {
        let message = match status {
            Some(status) => format!("{} job already exists ({})", kind.label(), status),
            None => format!("{} job already exists", kind.label()),
        };
        Self {
            job_created: false,
            message,
            job_id: Some(job_id),
            status,
        }
    }
}

/// Jobs canceled and files removed by a cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub canceled_jobs: Vec<JobId>,
    pub deleted_files: Vec<FileId>,
}

/// Coordinates the catalog, the file store and the dispatcher.
pub struct DerivationEngine {
    pub(crate) store: ArtifactStore,
    pub(crate) resolver: FileIdentityResolver,
    pub(crate) planner: JobPlanner,
    pub(crate) locks: KeyLocks,
}

impl DerivationEngine {
    pub fn new(store: ArtifactStore, planner: JobPlanner) -> Self {
        Self {
            resolver: FileIdentityResolver::new(store.clone()),
            store,
            planner,
            locks: KeyLocks::new(),
        }
    }

    pub fn from_config(store: ArtifactStore, config: &EngineConfig) -> Self {
        Self::new(store, JobPlanner::new(config.job_title_prefix.clone()))
    }

    /// Build an engine over the catalog database `config` names, or a
    /// private in-memory one when none is configured.
    pub async fn open(
        config: &EngineConfig,
        files: Arc<dyn FileStore>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> EngineResult<Self> {
        let repository = match &config.catalog_path {
            Some(path) => SqliteArtifactRepository::open(path).await?,
            None => SqliteArtifactRepository::in_memory().await?,
        };
        let store = ArtifactStore::new(Arc::new(repository), files, dispatcher);
        Ok(Self::from_config(store, config))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn resolver(&self) -> &FileIdentityResolver {
        &self.resolver
    }

    /// Dispatch a derivation job for `(kind, source, format)`.
    ///
    /// Without `force`, a tracked job whose status is not `Error` or
    /// `Canceled` makes this a no-op; a tracked job the dispatcher reports
    /// no status for counts as live. With `force`, the key's previous jobs
    /// and outputs are canceled and purged first (cascading over every
    /// format for source analysis). The whole sequence runs under the
    /// key's lock, so concurrent callers dispatch at most one job.
    pub async fn request_derivation(
        &self,
        kind: DerivationType,
        source: &FileId,
        format: Option<&VideoFormat>,
        force: bool,
    ) -> EngineResult<DerivationOutcome> {
        if kind == DerivationType::Transcoding && format.is_none() {
            return Err(EngineError::FormatRequired);
        }

        let key = DedupKey::new(kind, source.clone(), format.map(|f| f.id.clone()));
        let _guard = self.locks.lock(&key).await;

        if !force {
            if let Some(existing) = self.store.find_active_job(&key).await? {
                let status = self.store.dispatcher().status(&existing.job_id).await?;
                if status.map_or(true, |s| s.blocks_resubmission()) {
                    debug!(key = %key, job_id = %existing.job_id, ?status, "Job already tracked");
                    metrics::record_deduplicated(kind);
                    return Ok(DerivationOutcome::existing(kind, existing.job_id, status));
                }
                debug!(key = %key, job_id = %existing.job_id, ?status, "Replacing failed job");
            }
        }

        let (input, frames) = self.derivation_input(kind, source, format).await?;

        if force {
            let report = self.clear_for_rerun(kind, source, format).await?;
            debug!(
                key = %key,
                canceled = report.canceled_jobs.len(),
                deleted = report.deleted_files.len(),
                "Cleared previous results"
            );
        }

        let artifact = self.store.get_or_create_artifact(source, format).await?;
        let spec = match (kind, format) {
            (DerivationType::Analysis, _) => self.planner.analysis(&key, &input, &artifact),
            (DerivationType::Transcoding, Some(format)) => {
                self.planner.transcoding(&key, &input, &artifact, format)
            }
            (DerivationType::Transcoding, None) => return Err(EngineError::FormatRequired),
            (DerivationType::FrameExtraction, _) => {
                self.planner.frame_extraction(&key, &input, &artifact, frames.unwrap_or(0))
            }
        };

        let job_id = self.store.dispatcher().submit(spec).await?;
        self.store
            .record_job(kind, &input.id, source, format, job_id.clone())
            .await?;

        info!(
            job_id = %job_id,
            kind = %kind,
            source = %source,
            format = format.map(|f| f.name.as_str()).unwrap_or("source"),
            force,
            "Dispatched derivation job"
        );
        metrics::record_dispatched(kind);

        Ok(DerivationOutcome::created(kind, job_id))
    }

    /// The file a job of `kind` reads, plus the frame count for extraction.
    async fn derivation_input(
        &self,
        kind: DerivationType,
        source: &FileId,
        format: Option<&VideoFormat>,
    ) -> EngineResult<(StoredFile, Option<u64>)> {
        if kind == DerivationType::Transcoding {
            return Ok((self.store.files().load(source).await?, None));
        }

        let artifact = self
            .store
            .find_artifact(source, format.map(|f| &f.id))
            .await?;

        let file_id = match format {
            None => source.clone(),
            Some(format) => artifact
                .as_ref()
                .and_then(|a| a.file_id.clone())
                .ok_or_else(|| not_transcoded(Some(&format.name)))?,
        };

        let frames = if kind == DerivationType::FrameExtraction {
            let count = artifact
                .as_ref()
                .and_then(|a| a.metadata.frame_count())
                .filter(|n| *n > 0)
                .ok_or_else(|| EngineError::missing_metadata("videoFrameCount"))?;
            Some(count)
        } else {
            None
        };

        Ok((self.store.files().load(&file_id).await?, frames))
    }

    /// Cancel and purge what a forced re-run of `kind` supersedes.
    async fn clear_for_rerun(
        &self,
        kind: DerivationType,
        source: &FileId,
        format: Option<&VideoFormat>,
    ) -> EngineResult<CleanupReport> {
        let exact = CleanupScope::exact(source, format.map(|f| &f.id));

        match (kind, format) {
            (DerivationType::Analysis, None) => {
                self.cleanup(
                    &CleanupScope::cascade(source),
                    &DerivationType::ALL,
                    &[ArtifactKind::File, ArtifactKind::Frame],
                )
                .await
            }
            (DerivationType::Analysis, Some(format)) => {
                let report = self
                    .cleanup(
                        &exact,
                        &[DerivationType::Analysis, DerivationType::FrameExtraction],
                        &[ArtifactKind::Frame],
                    )
                    .await?;

                // The rendition file is the analysis input and stays.
                if let Some(mut artifact) = self.store.find_artifact(source, Some(&format.id)).await? {
                    artifact.set_metadata(VideoMetadata::default());
                    self.store.repository().save_artifact(artifact).await?;
                }
                Ok(report)
            }
            (DerivationType::Transcoding, _) => {
                self.cleanup(
                    &exact,
                    &[DerivationType::Transcoding, DerivationType::FrameExtraction],
                    &[ArtifactKind::File, ArtifactKind::Frame],
                )
                .await
            }
            (DerivationType::FrameExtraction, _) => {
                self.cleanup(&exact, &[DerivationType::FrameExtraction], &[ArtifactKind::Frame])
                    .await
            }
        }
    }

    /// Cancel `jobs` kinds, then purge `artifacts` kinds, within `scope`.
    pub(crate) async fn cleanup(
        &self,
        scope: &CleanupScope,
        jobs: &[DerivationType],
        artifacts: &[ArtifactKind],
    ) -> EngineResult<CleanupReport> {
        let canceled_jobs = self.store.cancel_jobs(scope, jobs).await?;
        let deleted_files = self.store.purge_artifacts(scope, artifacts).await?;
        metrics::record_cleanup(canceled_jobs.len(), deleted_files.len());

        Ok(CleanupReport {
            canceled_jobs,
            deleted_files,
        })
    }
}

pub(crate) fn not_transcoded(format_name: Option<&str>) -> EngineError {
    match format_name {
        Some(name) => EngineError::not_found(format!(
            "Source video has not been transcoded to format: '{}'",
            name
        )),
        None => EngineError::not_found("No source video found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use vderive_models::VideoFrame;
    use vderive_queue::{JobSource, LocalQueue};
    use vderive_storage::LocalFileStore;

    #[tokio::test]
    async fn test_concurrent_requests_dispatch_once() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = h.engine.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .request_derivation(DerivationType::Analysis, &source, None, false)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().job_created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(h.queue.submitted().await.len(), 1);
        assert!(h.engine.locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_is_replaced_without_force() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;

        let first = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, false)
            .await
            .unwrap();
        let first_id = first.job_id.unwrap();

        let again = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, false)
            .await
            .unwrap();
        assert!(!again.job_created);
        assert_eq!(again.status, Some(JobStatus::Pending));

        h.queue.set_status(&first_id, JobStatus::Error).await.unwrap();
        let retry = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, false)
            .await
            .unwrap();
        assert!(retry.job_created);
        assert_ne!(retry.job_id, Some(first_id));

        let key = DedupKey::new(DerivationType::Analysis, source, None);
        let record = h.store.find_active_job(&key).await.unwrap().unwrap();
        assert_eq!(Some(record.job_id), retry.job_id);
    }

    #[tokio::test]
    async fn test_tracked_job_without_status_blocks() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;

        h.store
            .record_job(DerivationType::Analysis, &source, &source, None, JobId::from("expired"))
            .await
            .unwrap();

        let outcome = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, false)
            .await
            .unwrap();
        assert!(!outcome.job_created);
        assert_eq!(outcome.job_id, Some(JobId::from("expired")));
        assert_eq!(outcome.status, None);
        assert!(h.queue.submitted().await.is_empty());

        let forced = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, true)
            .await
            .unwrap();
        assert!(forced.job_created);
    }

    #[tokio::test]
    async fn test_transcoding_requires_format() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;

        let err = h
            .engine
            .request_derivation(DerivationType::Transcoding, &source, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FormatRequired));
    }

    #[tokio::test]
    async fn test_frame_extraction_needs_metadata() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;

        let err = h
            .engine
            .request_derivation(DerivationType::FrameExtraction, &source, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingMetadata(ref f) if f == "videoFrameCount"));

        let format = h.format("small").await;
        h.analyzed(&source, None, 3).await;
        let err = h
            .engine
            .request_derivation(DerivationType::FrameExtraction, &source, Some(&format), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_forced_source_analysis_cascades() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;
        let format = h.format("small").await;

        // A produced rendition with one frame and a live extraction job.
        let rendition = h.upload("clip-small.webm").await;
        let mut artifact = h
            .store
            .get_or_create_artifact(&source, Some(&format))
            .await
            .unwrap();
        artifact.set_file(rendition.clone());
        h.store.repository().save_artifact(artifact).await.unwrap();

        let image = h.upload("0.png").await;
        h.store
            .repository()
            .upsert_frame(VideoFrame::new(
                source.clone(),
                Some(format.id.clone()),
                Some(format.name.clone()),
                0,
                image.clone(),
            ))
            .await
            .unwrap();
        let extraction = h.queue.submit(h.spec_for(&source).await).await.unwrap();
        h.store
            .record_job(
                DerivationType::FrameExtraction,
                &rendition,
                &source,
                Some(&format),
                extraction.clone(),
            )
            .await
            .unwrap();

        let outcome = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, None, true)
            .await
            .unwrap();
        assert!(outcome.job_created);

        let repo = h.store.repository();
        assert!(repo.find_artifact(&source, Some(&format.id)).await.unwrap().is_none());
        assert!(repo.find_frame(&source, Some(&format.id), 0).await.unwrap().is_none());
        assert_eq!(h.queue.status(&extraction).await.unwrap(), Some(JobStatus::Canceled));
        assert!(h.files.load(&rendition).await.is_err());
        assert!(h.files.load(&image).await.is_err());
        // The source itself survives.
        assert!(h.files.load(&source).await.is_ok());

        let source_artifact = repo.find_artifact(&source, None).await.unwrap().unwrap();
        assert!(source_artifact.metadata.is_empty());

        let jobs = repo.jobs_in(&CleanupScope::cascade(&source)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, DerivationType::Analysis);
        assert_eq!(Some(jobs[0].job_id.clone()), outcome.job_id);
    }

    #[tokio::test]
    async fn test_forced_format_analysis_keeps_rendition() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;
        let format = h.format("small").await;
        let rendition = h.upload("clip-small.webm").await;

        let mut artifact = h
            .store
            .get_or_create_artifact(&source, Some(&format))
            .await
            .unwrap();
        artifact.set_file(rendition.clone());
        h.store.repository().save_artifact(artifact).await.unwrap();
        h.analyzed(&source, Some(&format), 4).await;

        let outcome = h
            .engine
            .request_derivation(DerivationType::Analysis, &source, Some(&format), true)
            .await
            .unwrap();
        assert!(outcome.job_created);

        let artifact = h
            .store
            .find_artifact(&source, Some(&format.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.file_id, Some(rendition.clone()));
        assert!(artifact.metadata.is_empty());
        assert!(h.files.load(&rendition).await.is_ok());

        let (_, spec) = h.queue.submitted().await.pop().unwrap();
        assert_eq!(spec.input.file_id, rendition);
    }

    #[tokio::test]
    async fn test_forced_transcoding_purges_rendition() {
        let h = Harness::new().await;
        let source = h.upload("clip.mp4").await;
        let format = h.format("small").await;
        let rendition = h.upload("clip-small.webm").await;

        h.analyzed(&source, None, 25).await;
        let analysis_job = JobId::from("source-analysis");
        h.store
            .record_job(DerivationType::Analysis, &source, &source, None, analysis_job.clone())
            .await
            .unwrap();

        let mut artifact = h
            .store
            .get_or_create_artifact(&source, Some(&format))
            .await
            .unwrap();
        artifact.set_file(rendition.clone());
        h.store.repository().save_artifact(artifact).await.unwrap();

        h.engine
            .request_derivation(DerivationType::Transcoding, &source, Some(&format), true)
            .await
            .unwrap();

        let artifact = h
            .store
            .find_artifact(&source, Some(&format.id))
            .await
            .unwrap()
            .unwrap();
        assert!(artifact.file_id.is_none());
        assert!(h.files.load(&rendition).await.is_err());

        // The source rendition and its analysis are outside the transcoding scope.
        let source_artifact = h.store.find_artifact(&source, None).await.unwrap().unwrap();
        assert_eq!(source_artifact.metadata.frame_count(), Some(25));
        assert!(h.files.load(&source).await.is_ok());
        let analysis_key = DedupKey::new(DerivationType::Analysis, source.clone(), None);
        let tracked = h.store.find_active_job(&analysis_key).await.unwrap().unwrap();
        assert_eq!(tracked.job_id, analysis_job);

        let (_, spec) = h.queue.submitted().await.pop().unwrap();
        assert_eq!(spec.input.file_id, source);
        assert_eq!(spec.kind, DerivationType::Transcoding);
    }

    #[tokio::test]
    async fn test_request_for_missing_file_fails() {
        let h = Harness::new().await;
        let err = h
            .engine
            .request_derivation(DerivationType::Analysis, &FileId::from("nope"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(h.queue.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_persists_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(LocalFileStore::new(dir.path().join("files")).await.unwrap());
        let config = EngineConfig {
            catalog_path: Some(dir.path().join("catalog.db")),
            job_title_prefix: "[clip]".into(),
        };

        let source = files.save_bytes(b"data".to_vec(), "clip.mp4").await.unwrap().id;
        let queue = Arc::new(LocalQueue::new());
        let engine = DerivationEngine::open(&config, files.clone(), queue.clone())
            .await
            .unwrap();
        tokio_test::assert_ok!(engine.analyze(&source, false).await);

        let (_, spec) = queue.submitted().await.pop().unwrap();
        assert!(spec.title.starts_with("[clip] "));

        let reopened = DerivationEngine::open(&config, files, Arc::new(LocalQueue::new()))
            .await
            .unwrap();
        let key = DedupKey::new(DerivationType::Analysis, source, None);
        assert!(reopened.store().find_active_job(&key).await.unwrap().is_some());
    }
}
