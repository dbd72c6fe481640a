//! Job payloads exchanged between the orchestrator and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vderive_models::{ConvertCommand, DerivationType, FileId, JobId};

/// Name of the analysis output inside a job's working directory.
pub const META_FILE: &str = "meta.json";

/// The stored file a job works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub file_id: FileId,
    /// Local name inside the working directory, `input.<ext>`
    pub name: String,
}

impl JobInput {
    pub fn new(file_id: FileId, extension: Option<&str>) -> Self {
        let name = match extension {
            Some(ext) if !ext.is_empty() => format!("input.{}", ext),
            _ => "input".to_string(),
        };
        Self { file_id, name }
    }
}

/// A file the job is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Path relative to the working directory
    pub path: String,
    /// Name to store the file under
    pub name: String,
    /// Opaque routing token returned with the produced file
    pub reference: String,
    /// Missing optional outputs are skipped instead of failing the job
    #[serde(default)]
    pub optional: bool,
}

impl JobOutput {
    pub fn required(path: impl Into<String>, name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            reference: reference.into(),
            optional: false,
        }
    }

    pub fn optional(path: impl Into<String>, name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(path, name, reference)
        }
    }
}

/// A unit of conversion work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub kind: DerivationType,
    pub input: JobInput,
    pub command: ConvertCommand,
    pub outputs: Vec<JobOutput>,
    /// Staging location label for the job's outputs
    #[serde(default)]
    pub staging: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Transport-level delivery handle (stream message ID for Redis)
    pub delivery_id: String,
    pub job_id: JobId,
    pub spec: JobSpec,
}

/// One output file uploaded by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOutput {
    pub file_id: FileId,
    pub name: String,
    pub reference: String,
}

/// Out-of-band notification that a job's outputs have landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub kind: DerivationType,
    pub outputs: Vec<CompletedOutput>,
    pub completed_at: DateTime<Utc>,
}

impl JobCompletion {
    pub fn new(job_id: JobId, kind: DerivationType, outputs: Vec<CompletedOutput>) -> Self {
        Self {
            job_id,
            kind,
            outputs,
            completed_at: Utc::now(),
        }
    }
}

/// What a job source did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Left for redelivery
    Retrying { attempt: u32 },
    /// Given up on; status is now `Error`
    DeadLettered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_name() {
        assert_eq!(JobInput::new(FileId::from("a"), Some("mp4")).name, "input.mp4");
        assert_eq!(JobInput::new(FileId::from("a"), None).name, "input");
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = JobSpec {
            title: "[video] Frame Extraction".into(),
            kind: DerivationType::FrameExtraction,
            input: JobInput::new(FileId::from("src"), Some("webm")),
            command: ConvertCommand::Extract { frames: 2 },
            outputs: vec![JobOutput::optional("1.png", "0.png", "ref")],
            staging: Some("src-source".into()),
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "frame_extraction");
        assert_eq!(json["command"]["command"], "extract");
        assert_eq!(json["outputs"][0]["optional"], true);

        let back: JobSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
