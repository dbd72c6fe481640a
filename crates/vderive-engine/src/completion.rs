//! Ingestion of job completions into the catalog.

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vderive_models::{
    CompletionReference, DedupKey, DerivationType, FileId, JobId, VideoFormat, VideoFrame,
    VideoMetadata,
};
use vderive_queue::{CompletedOutput, CompletionSink, JobCompletion, QueueError, QueueResult};

use crate::engine::{DerivationEngine, DerivationOutcome};
use crate::error::{EngineError, EngineResult};
use crate::metrics;

/// What happened to a delivered completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// No output carried a reference token of ours
    Ignored,
    /// The job was canceled or superseded; its files were removed
    Stale { removed: Vec<FileId> },
    /// Outputs were recorded; `follow_on` is the chained derivation, if any
    Ingested { follow_on: Option<DerivationOutcome> },
}

type Routed = Vec<(CompletionReference, CompletedOutput)>;

/// The chained request a completion triggers.
struct FollowOn {
    kind: DerivationType,
    force: bool,
}

enum Applied {
    Stale(Vec<FileId>),
    Recorded {
        format: Option<VideoFormat>,
        follow_on: Option<FollowOn>,
    },
}

impl DerivationEngine {
    /// Apply a finished job's outputs.
    ///
    /// Outputs are routed by their reference token. A completion whose job
    /// is no longer the tracking record for its key is discarded and its
    /// files removed. Chained work is requested only after the outputs are
    /// recorded.
    pub async fn handle_completion(&self, completion: JobCompletion) -> EngineResult<CompletionOutcome> {
        let routed: Routed = completion
            .outputs
            .into_iter()
            .filter_map(|output| match CompletionReference::decode(&output.reference) {
                Some(reference) => Some((reference, output)),
                None => {
                    debug!(reference = %output.reference, "Ignoring foreign output");
                    None
                }
            })
            .collect();

        let Some(key) = routed.first().map(|(reference, _)| reference.key()) else {
            debug!(job_id = %completion.job_id, "Completion carries no routable outputs");
            return Ok(CompletionOutcome::Ignored);
        };

        let (format, follow_on) = match self.apply(&key, &completion.job_id, routed).await? {
            Applied::Stale(removed) => return Ok(CompletionOutcome::Stale { removed }),
            Applied::Recorded { format, follow_on } => (format, follow_on),
        };

        let follow_on = match follow_on {
            None => None,
            Some(FollowOn { kind, force }) => {
                match self
                    .request_derivation(kind, &key.source_file_id, format.as_ref(), force)
                    .await
                {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(key = %key, follow_on = %kind, error = %e, "Chained derivation failed");
                        None
                    }
                }
            }
        };

        Ok(CompletionOutcome::Ingested { follow_on })
    }

    async fn apply(&self, key: &DedupKey, job_id: &JobId, routed: Routed) -> EngineResult<Applied> {
        let _guard = self.locks.lock(key).await;

        let current = self.store.find_active_job(key).await?;
        if current.as_ref().map(|job| &job.job_id) != Some(job_id) {
            let mut removed = Vec::new();
            for (_, output) in &routed {
                if self.store.remove_file(&output.file_id).await {
                    removed.push(output.file_id.clone());
                }
            }
            info!(key = %key, job_id = %job_id, removed = removed.len(), "Discarded stale completion");
            metrics::record_completion(key.kind, true);
            return Ok(Applied::Stale(removed));
        }

        let format = match key.format_id.as_ref() {
            Some(id) => Some(self.store.find_format_by_id(id).await?),
            None => None,
        };

        let routed: Routed = routed
            .into_iter()
            .filter(|(reference, output)| {
                let ours = reference.key() == *key;
                if !ours {
                    warn!(key = %key, file_id = %output.file_id, "Output routed to another key");
                }
                ours
            })
            .collect();

        let follow_on = match key.kind {
            DerivationType::Analysis => self.ingest_metadata(key, format.as_ref(), &routed).await?,
            DerivationType::Transcoding => self.ingest_rendition(key, format.as_ref(), &routed).await?,
            DerivationType::FrameExtraction => {
                self.ingest_frames(key, format.as_ref(), &routed).await?;
                None
            }
        };

        metrics::record_completion(key.kind, false);
        info!(key = %key, job_id = %job_id, outputs = routed.len(), "Ingested completion");
        Ok(Applied::Recorded { format, follow_on })
    }

    async fn ingest_metadata(
        &self,
        key: &DedupKey,
        format: Option<&VideoFormat>,
        routed: &Routed,
    ) -> EngineResult<Option<FollowOn>> {
        let (_, output) = routed
            .iter()
            .find(|(reference, _)| reference.index.is_none())
            .ok_or_else(|| EngineError::invalid_completion("analysis produced no metadata"))?;

        let bytes = self.store.files().read(&output.file_id).await?;
        let metadata: VideoMetadata = serde_json::from_slice(&bytes)?;
        self.store.remove_file(&output.file_id).await;

        let frames = metadata.frame_count().unwrap_or(0);
        let mut artifact = self
            .store
            .get_or_create_artifact(&key.source_file_id, format)
            .await?;
        artifact.set_metadata(metadata);
        self.store.repository().save_artifact(artifact).await?;

        debug!(key = %key, frames, "Recorded metadata");
        Ok((frames > 0).then_some(FollowOn {
            kind: DerivationType::FrameExtraction,
            force: false,
        }))
    }

    async fn ingest_rendition(
        &self,
        key: &DedupKey,
        format: Option<&VideoFormat>,
        routed: &Routed,
    ) -> EngineResult<Option<FollowOn>> {
        let (_, output) = routed
            .first()
            .ok_or_else(|| EngineError::invalid_completion("transcoding produced no file"))?;

        let mut artifact = self
            .store
            .get_or_create_artifact(&key.source_file_id, format)
            .await?;
        let previous = artifact.set_file(output.file_id.clone());
        self.store.repository().save_artifact(artifact).await?;

        if let Some(previous) = previous {
            if previous != output.file_id && previous != key.source_file_id {
                self.store.remove_file(&previous).await;
            }
        }

        Ok(Some(FollowOn {
            kind: DerivationType::Analysis,
            force: true,
        }))
    }

    async fn ingest_frames(
        &self,
        key: &DedupKey,
        format: Option<&VideoFormat>,
        routed: &Routed,
    ) -> EngineResult<()> {
        for (reference, output) in routed {
            let Some(index) = reference.index else {
                warn!(key = %key, file_id = %output.file_id, "Frame output without index");
                continue;
            };

            let frame = VideoFrame::new(
                key.source_file_id.clone(),
                key.format_id.clone(),
                format.map(|f| f.name.clone()),
                index,
                output.file_id.clone(),
            );
            if let Some(previous) = self.store.repository().upsert_frame(frame).await? {
                if previous.file_id != output.file_id {
                    self.store.remove_file(&previous.file_id).await;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionSink for DerivationEngine {
    async fn deliver(&self, completion: JobCompletion) -> QueueResult<()> {
        self.handle_completion(completion)
            .await
            .map(|_| ())
            .map_err(|e| QueueError::completion_rejected(e.to_string()))
    }
}
