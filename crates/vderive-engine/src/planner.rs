//! Construction of job payloads for each derivation kind.

use chrono::Utc;
use vderive_models::{
    CompletionReference, ConvertCommand, DedupKey, DerivationType, VideoArtifact, VideoFormat,
};
use vderive_queue::{JobInput, JobOutput, JobSpec, META_FILE};
use vderive_storage::StoredFile;

use crate::config::DEFAULT_JOB_TITLE_PREFIX;

/// Builds [`JobSpec`]s. Every output carries the completion reference of
/// the job's dedup key so completions can be routed back.
#[derive(Debug, Clone)]
pub struct JobPlanner {
    title_prefix: String,
}

impl Default for JobPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TITLE_PREFIX)
    }
}

impl JobPlanner {
    pub fn new(title_prefix: impl Into<String>) -> Self {
        Self {
            title_prefix: title_prefix.into(),
        }
    }

    /// Probe the input and store `meta.json`.
    pub fn analysis(&self, key: &DedupKey, input: &StoredFile, artifact: &VideoArtifact) -> JobSpec {
        let reference = CompletionReference::for_key(key).encode();
        self.spec(
            key.kind,
            input,
            artifact,
            ConvertCommand::Analyze,
            vec![JobOutput::required(META_FILE, META_FILE, reference)],
        )
    }

    /// Encode the source into `format`.
    pub fn transcoding(
        &self,
        key: &DedupKey,
        input: &StoredFile,
        artifact: &VideoArtifact,
        format: &VideoFormat,
    ) -> JobSpec {
        let reference = CompletionReference::for_key(key).encode();
        let extension = format.file_extension();
        let stem = input
            .name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&input.name);

        self.spec(
            key.kind,
            input,
            artifact,
            format.transcode_command(),
            vec![JobOutput::required(
                format!("output.{}", extension),
                format!("{}-{}.{}", stem, format.name, extension),
                reference,
            )],
        )
    }

    /// Extract `frames` still images. The tool numbers images from 1, the
    /// catalog indexes them from 0.
    pub fn frame_extraction(
        &self,
        key: &DedupKey,
        input: &StoredFile,
        artifact: &VideoArtifact,
        frames: u64,
    ) -> JobSpec {
        let base = CompletionReference::for_key(key);
        let outputs = (0..frames)
            .map(|index| {
                JobOutput::optional(
                    format!("{}.png", index + 1),
                    format!("{}.png", index),
                    base.clone().with_index(index).encode(),
                )
            })
            .collect();

        self.spec(key.kind, input, artifact, ConvertCommand::Extract { frames }, outputs)
    }

    fn spec(
        &self,
        kind: DerivationType,
        input: &StoredFile,
        artifact: &VideoArtifact,
        command: ConvertCommand,
        outputs: Vec<JobOutput>,
    ) -> JobSpec {
        JobSpec {
            title: format!("{} {}", self.title_prefix, kind.label()),
            kind,
            input: JobInput::new(input.id.clone(), input.extension().as_deref()),
            command,
            outputs,
            staging: artifact.cache_id.clone(),
            created_at: Utc::now(),
        }
    }
}
