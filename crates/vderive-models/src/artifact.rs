//! Derived video artifacts: renditions, probe metadata and extracted frames.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{FileId, FormatId};

/// Closed set of record kinds held by the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A rendition of a video (the source itself or a transcoded copy)
    File,
    /// A named transcoding profile
    Format,
    /// An extracted still image
    Frame,
    /// A job tracking record
    Job,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Format => "format",
            ArtifactKind::Frame => "frame",
            ArtifactKind::Job => "job",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Probe results for one rendition.
///
/// This is also the wire shape of the `meta.json` file produced by the
/// analysis job, hence the camelCase keys. Every field is optional; the
/// probe tool reports what it can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoMetadata {
    /// Duration in seconds
    pub duration: Option<f64>,
    /// Width in pixels
    pub video_width: Option<u32>,
    /// Height in pixels
    pub video_height: Option<u32>,
    /// Frames per second
    pub video_frame_rate: Option<f64>,
    /// Total number of frames
    pub video_frame_count: Option<u64>,
    /// Video bit rate in bits/second
    pub video_bit_rate: Option<f64>,
    /// Video codec name
    pub video_codec: Option<String>,
    /// Audio bit rate in bits/second
    pub audio_bit_rate: Option<f64>,
    /// Audio sample rate in Hz
    pub audio_sample_rate: Option<f64>,
    /// Audio sample format (e.g. "fltp")
    pub audio_sample_format: Option<String>,
    /// Number of audio channels
    pub audio_channel_count: Option<u32>,
    /// Audio channel layout (e.g. "stereo")
    pub audio_channel_layout: Option<String>,
    /// Audio codec name
    pub audio_codec: Option<String>,
}

impl VideoMetadata {
    /// Frame count, if the probe reported a positive one.
    pub fn frame_count(&self) -> Option<u64> {
        self.video_frame_count.filter(|count| *count > 0)
    }

    /// Check whether the probe populated anything at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One rendition of a source video, keyed by `(source_file_id, format_id)`.
///
/// `format_id == None` is the source rendition; its `file_id` equals
/// `source_file_id`. A format rendition has no `file_id` until its
/// transcoding job lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VideoArtifact {
    /// Original file this rendition traces back to
    pub source_file_id: FileId,

    /// Format this rendition was transcoded into (None for the source)
    #[serde(default)]
    pub format_id: Option<FormatId>,

    /// Name of the format, denormalised for display
    #[serde(default)]
    pub format_name: Option<String>,

    /// Stored file holding this rendition
    #[serde(default)]
    pub file_id: Option<FileId>,

    /// Probe results
    #[serde(default)]
    pub metadata: VideoMetadata,

    /// Staging location label for this rendition's job outputs
    #[serde(default)]
    pub cache_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoArtifact {
    /// Create the record for a source rendition.
    pub fn source(source_file_id: FileId) -> Self {
        Self::new(source_file_id.clone(), None, None, Some(source_file_id))
    }

    /// Create the record for a not-yet-produced format rendition.
    pub fn rendition(source_file_id: FileId, format_id: FormatId, format_name: Option<String>) -> Self {
        Self::new(source_file_id, Some(format_id), format_name, None)
    }

    fn new(
        source_file_id: FileId,
        format_id: Option<FormatId>,
        format_name: Option<String>,
        file_id: Option<FileId>,
    ) -> Self {
        let now = Utc::now();
        let cache_id = Some(cache_label(&source_file_id, format_id.as_ref()));
        Self {
            source_file_id,
            format_id,
            format_name,
            file_id,
            metadata: VideoMetadata::default(),
            cache_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether this is the source rendition.
    pub fn is_source(&self) -> bool {
        self.format_id.is_none()
    }

    /// Check whether `file_id` is a derivative (not the source file itself).
    pub fn is_derivative_file(&self, file_id: &FileId) -> bool {
        self.file_id.as_ref() == Some(file_id) && *file_id != self.source_file_id
    }

    /// Replace the probe metadata.
    pub fn set_metadata(&mut self, metadata: VideoMetadata) {
        self.metadata = metadata;
        self.updated_at = Utc::now();
    }

    /// Point this rendition at a newly produced file, returning the previous one.
    pub fn set_file(&mut self, file_id: FileId) -> Option<FileId> {
        self.updated_at = Utc::now();
        self.file_id.replace(file_id)
    }
}

fn cache_label(source: &FileId, format: Option<&FormatId>) -> String {
    match format {
        Some(format) => format!("{}-{}", source, format),
        None => format!("{}-source", source),
    }
}

/// One extracted still image, keyed by `(source_file_id, format_id, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VideoFrame {
    /// Original file the frame traces back to
    pub source_file_id: FileId,
    /// Format rendition the frame was extracted from (None for the source)
    #[serde(default)]
    pub format_id: Option<FormatId>,
    /// Name of the format, denormalised for display
    #[serde(default)]
    pub format_name: Option<String>,
    /// 0-based chronological position
    pub index: u64,
    /// Stored image file
    pub file_id: FileId,
    pub created_at: DateTime<Utc>,
}

impl VideoFrame {
    pub fn new(
        source_file_id: FileId,
        format_id: Option<FormatId>,
        format_name: Option<String>,
        index: u64,
        file_id: FileId,
    ) -> Self {
        Self {
            source_file_id,
            format_id,
            format_name,
            index,
            file_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_artifact_points_at_itself() {
        let artifact = VideoArtifact::source(FileId::from("src"));
        assert!(artifact.is_source());
        assert_eq!(artifact.file_id, Some(FileId::from("src")));
        assert!(!artifact.is_derivative_file(&FileId::from("src")));
        assert_eq!(artifact.cache_id.as_deref(), Some("src-source"));
    }

    #[test]
    fn test_rendition_has_no_file_until_produced() {
        let mut artifact =
            VideoArtifact::rendition(FileId::from("src"), FormatId::from("fmt"), Some("web".into()));
        assert!(!artifact.is_source());
        assert!(artifact.file_id.is_none());

        assert_eq!(artifact.set_file(FileId::from("out-1")), None);
        assert!(artifact.is_derivative_file(&FileId::from("out-1")));
        assert_eq!(artifact.set_file(FileId::from("out-2")), Some(FileId::from("out-1")));
    }

    #[test]
    fn test_metadata_parses_meta_json_shape() {
        let json = r#"{
            "audioBitRate": 128000.0,
            "audioChannelCount": 2,
            "audioChannelLayout": "stereo",
            "audioSampleFormat": "fltp",
            "audioSampleRate": 48000.0,
            "duration": 12.5,
            "videoBitRate": null,
            "videoFrameCount": 300,
            "videoFrameRate": 24.0,
            "videoHeight": 720,
            "videoWidth": 1280
        }"#;

        let meta: VideoMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.video_frame_count, Some(300));
        assert_eq!(meta.frame_count(), Some(300));
        assert_eq!(meta.video_width, Some(1280));
        assert_eq!(meta.audio_channel_layout.as_deref(), Some("stereo"));
        assert!(meta.video_bit_rate.is_none());
        assert!(meta.video_codec.is_none());
    }

    #[test]
    fn test_zero_frame_count_is_not_a_frame_count() {
        let meta = VideoMetadata {
            video_frame_count: Some(0),
            ..Default::default()
        };
        assert_eq!(meta.frame_count(), None);
        assert!(VideoMetadata::default().is_empty());
    }
}
