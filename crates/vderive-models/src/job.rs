//! Derivation job tracking records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{FileId, FormatId, JobId};

/// The three derivation actions.
///
/// Analysis is upstream of transcoding, which is upstream of frame
/// extraction for the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DerivationType {
    /// Probe a rendition for metadata
    Analysis,
    /// Produce a rendition in a named format
    Transcoding,
    /// Extract still images from a rendition
    FrameExtraction,
}

impl DerivationType {
    pub const ALL: [DerivationType; 3] = [
        DerivationType::Analysis,
        DerivationType::Transcoding,
        DerivationType::FrameExtraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationType::Analysis => "analysis",
            DerivationType::Transcoding => "transcoding",
            DerivationType::FrameExtraction => "frame_extraction",
        }
    }

    /// Human-readable label, used in job titles.
    pub fn label(&self) -> &'static str {
        match self {
            DerivationType::Analysis => "Analysis",
            DerivationType::Transcoding => "Transcoding",
            DerivationType::FrameExtraction => "Frame Extraction",
        }
    }
}

impl fmt::Display for DerivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a dispatched job as reported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not yet picked up
    #[default]
    Pending,
    /// A worker is executing it
    Running,
    /// Finished and outputs were delivered
    Success,
    /// Failed
    Error,
    /// Canceled before completion
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Canceled)
    }

    /// Live and successful jobs block re-submission for their key;
    /// failed and canceled ones do not.
    pub fn blocks_resubmission(&self) -> bool {
        !matches!(self, JobStatus::Error | JobStatus::Canceled)
    }

    /// Parse the `as_str` form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "error" => Some(JobStatus::Error),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deduplication key: at most one tracking record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct DedupKey {
    pub kind: DerivationType,
    pub source_file_id: FileId,
    pub format_id: Option<FormatId>,
}

impl DedupKey {
    pub fn new(kind: DerivationType, source_file_id: FileId, format_id: Option<FormatId>) -> Self {
        Self {
            kind,
            source_file_id,
            format_id,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.format_id {
            Some(format) => write!(f, "{}:{}:{}", self.kind, self.source_file_id, format),
            None => write!(f, "{}:{}:source", self.kind, self.source_file_id),
        }
    }
}

/// Links a derivation action to the externally dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VideoJob {
    /// Which derivation this job performs
    pub kind: DerivationType,
    /// Input file handed to the job
    pub file_id: FileId,
    /// Original file the job traces back to
    pub source_file_id: FileId,
    #[serde(default)]
    pub format_id: Option<FormatId>,
    #[serde(default)]
    pub format_name: Option<String>,
    /// Dispatcher handle
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

impl VideoJob {
    pub fn new(
        kind: DerivationType,
        file_id: FileId,
        source_file_id: FileId,
        format_id: Option<FormatId>,
        format_name: Option<String>,
        job_id: JobId,
    ) -> Self {
        Self {
            kind,
            file_id,
            source_file_id,
            format_id,
            format_name,
            job_id,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.kind, self.source_file_id.clone(), self.format_id.clone())
    }
}
