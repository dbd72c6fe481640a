//! Shared fixtures for engine tests.

use std::sync::Arc;

use tempfile::TempDir;
use vderive_catalog::{ArtifactStore, SqliteArtifactRepository};
use vderive_models::{
    CompletionReference, DedupKey, DerivationType, FileId, JobId, NewVideoFormat, VideoArtifact,
    VideoFormat, VideoMetadata,
};
use vderive_queue::{CompletedOutput, JobCompletion, JobSpec, LocalQueue};
use vderive_storage::{FileStore, LocalFileStore};

use crate::completion::CompletionOutcome;
use crate::engine::DerivationEngine;
use crate::planner::JobPlanner;

pub(crate) struct Harness {
    pub engine: Arc<DerivationEngine>,
    pub store: ArtifactStore,
    pub files: Arc<LocalFileStore>,
    pub queue: Arc<LocalQueue>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(LocalFileStore::new(dir.path().join("files")).await.unwrap());
        let queue = Arc::new(LocalQueue::new());
        let store = ArtifactStore::new(
            Arc::new(SqliteArtifactRepository::in_memory().await.unwrap()),
            files.clone(),
            queue.clone(),
        );
        let engine = Arc::new(DerivationEngine::new(store.clone(), JobPlanner::default()));

        Self {
            engine,
            store,
            files,
            queue,
            _dir: dir,
        }
    }

    pub async fn upload(&self, name: &str) -> FileId {
        self.files
            .save_bytes(b"data".to_vec(), name)
            .await
            .unwrap()
            .id
    }

    pub async fn format(&self, name: &str) -> VideoFormat {
        self.store
            .create_format(NewVideoFormat::new(name))
            .await
            .unwrap()
    }

    fn metadata(frames: u64, duration: f64) -> VideoMetadata {
        VideoMetadata {
            video_frame_count: Some(frames),
            duration: Some(duration),
            ..Default::default()
        }
    }

    /// Record metadata for a rendition as if analysis had completed.
    pub async fn analyzed(&self, source: &FileId, format: Option<&VideoFormat>, frames: u64) {
        let mut artifact = self
            .store
            .get_or_create_artifact(source, format)
            .await
            .unwrap();
        artifact.set_metadata(Self::metadata(frames, frames as f64));
        self.store.repository().save_artifact(artifact).await.unwrap();
    }

    /// An analysis payload for `source`, for submitting outside the engine.
    pub async fn spec_for(&self, source: &FileId) -> JobSpec {
        let input = self.files.load(source).await.unwrap();
        let key = DedupKey::new(DerivationType::Analysis, source.clone(), None);
        JobPlanner::default().analysis(&key, &input, &VideoArtifact::source(source.clone()))
    }

    /// Store a `meta.json` as an analysis job would.
    pub async fn meta_file(&self, frames: u64, duration: f64) -> FileId {
        let json = serde_json::to_vec(&Self::metadata(frames, duration)).unwrap();
        self.files.save_bytes(json, "meta.json").await.unwrap().id
    }

    /// Build the completion a worker would deliver for `job_id`, mapping
    /// each produced file to the declared output with the same frame index.
    pub async fn completion_for(
        &self,
        job_id: &JobId,
        produced: Vec<(FileId, Option<u64>)>,
    ) -> JobCompletion {
        let (_, spec) = self
            .queue
            .submitted()
            .await
            .into_iter()
            .find(|(id, _)| id == job_id)
            .unwrap();

        let outputs = produced
            .into_iter()
            .map(|(file_id, index)| {
                let output = spec
                    .outputs
                    .iter()
                    .find(|o| {
                        CompletionReference::decode(&o.reference).map(|r| r.index) == Some(index)
                    })
                    .unwrap();
                CompletedOutput {
                    file_id,
                    name: output.name.clone(),
                    reference: output.reference.clone(),
                }
            })
            .collect();

        JobCompletion::new(job_id.clone(), spec.kind, outputs)
    }

    pub async fn complete_analysis(&self, job_id: &JobId, frames: u64, duration: f64) -> CompletionOutcome {
        let meta = self.meta_file(frames, duration).await;
        let completion = self.completion_for(job_id, vec![(meta, None)]).await;
        self.engine.handle_completion(completion).await.unwrap()
    }
}
