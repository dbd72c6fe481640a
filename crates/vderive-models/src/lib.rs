//! Shared data models for the video derivative orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - File, format and job identifiers
//! - Renditions, probe metadata and extracted frames
//! - Named transcoding formats
//! - Job tracking records and dispatcher statuses
//! - The convert-helper command encoding and completion reference tokens
//! - Frame index resolution

pub mod artifact;
pub mod convert;
pub mod format;
pub mod frame_index;
pub mod ids;
pub mod job;
pub mod reference;

// Re-export common types
pub use artifact::{ArtifactKind, VideoArtifact, VideoFrame, VideoMetadata};
pub use convert::{ConvertCommand, ConvertParseError, TranscodeFlag};
pub use format::{
    parse_dimensions, FormatError, NewVideoFormat, VideoFormat, DEFAULT_AUDIO_CODEC,
    DEFAULT_VIDEO_CODEC,
};
pub use frame_index::{
    parse_timestamp, resolve_frame_index, FrameIndexError, FrameIndexResult, FrameRequest,
};
pub use ids::{FileId, FormatId, JobId};
pub use job::{DedupKey, DerivationType, JobStatus, VideoJob};
pub use reference::CompletionReference;
