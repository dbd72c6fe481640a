//! Named transcoding profiles.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convert::{ConvertCommand, TranscodeFlag};
use crate::FormatId;

/// Video codec used when a new format does not name one.
pub const DEFAULT_VIDEO_CODEC: &str = "VP9";

/// Audio codec used when a new format does not name one.
pub const DEFAULT_AUDIO_CODEC: &str = "OPUS";

/// Error building a format from user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Format name cannot be empty")]
    EmptyName,

    #[error("Invalid dimensions '{0}'. Use WIDTHxHEIGHT, e.g. 1280x720")]
    InvalidDimensions(String),
}

/// A named target encoding profile.
///
/// Every target is optional; `None` means "keep the source value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VideoFormat {
    /// Unique format ID
    pub id: FormatId,
    /// Unique, externally used name
    pub name: String,
    /// Video codec (e.g. "VP9")
    #[serde(default)]
    pub video_codec: Option<String>,
    /// Audio codec (e.g. "OPUS")
    #[serde(default)]
    pub audio_codec: Option<String>,
    /// Target width in pixels
    #[serde(default)]
    pub video_width: Option<u32>,
    /// Target height in pixels
    #[serde(default)]
    pub video_height: Option<u32>,
    /// Target audio sample rate (ffmpeg `-ar` value)
    #[serde(default)]
    pub audio_sample_rate: Option<String>,
    /// Target audio bit rate (ffmpeg `-b:a` value)
    #[serde(default)]
    pub audio_bit_rate: Option<String>,
    /// Target video bit rate (ffmpeg `-b:v` value)
    #[serde(default)]
    pub video_bit_rate: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VideoFormat {
    /// Target dimensions as `WxH`, when both sides are set.
    pub fn dimensions(&self) -> Option<String> {
        match (self.video_width, self.video_height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }

    /// File extension of renditions produced with this format.
    pub fn file_extension(&self) -> &'static str {
        match self.video_codec.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("H264") | Some("H265") | Some("HEVC") => "mp4",
            _ => "webm",
        }
    }

    /// Convert command producing a rendition in this format.
    ///
    /// Flags appear in a fixed order and unset targets are omitted.
    pub fn transcode_command(&self) -> ConvertCommand {
        let candidates = [
            (TranscodeFlag::VideoCodec, self.video_codec.clone()),
            (TranscodeFlag::AudioCodec, self.audio_codec.clone()),
            (TranscodeFlag::Dimensions, self.dimensions()),
            (TranscodeFlag::AudioSampleRate, self.audio_sample_rate.clone()),
            (TranscodeFlag::AudioBitRate, self.audio_bit_rate.clone()),
            (TranscodeFlag::VideoBitRate, self.video_bit_rate.clone()),
        ];

        let params = candidates
            .into_iter()
            .filter_map(|(flag, value)| value.filter(|v| !v.is_empty()).map(|v| (flag, v)))
            .collect();

        ConvertCommand::Transcode {
            params,
            extension: self.file_extension().to_string(),
        }
    }
}

/// Administrative input for creating a format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewVideoFormat {
    pub name: String,
    /// Dimensions as `WxH`
    #[serde(default)]
    pub dimensions: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub audio_sample_rate: Option<String>,
    #[serde(default)]
    pub audio_bit_rate: Option<String>,
    #[serde(default)]
    pub video_bit_rate: Option<String>,
}

impl NewVideoFormat {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set dimensions (`WxH`).
    pub fn with_dimensions(mut self, dimensions: impl Into<String>) -> Self {
        self.dimensions = Some(dimensions.into());
        self
    }

    /// Set the video codec.
    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = Some(codec.into());
        self
    }

    /// Set the video bit rate.
    pub fn with_video_bit_rate(mut self, rate: impl Into<String>) -> Self {
        self.video_bit_rate = Some(rate.into());
        self
    }

    /// Validate and build the stored format.
    pub fn into_format(self) -> Result<VideoFormat, FormatError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(FormatError::EmptyName);
        }

        let (video_width, video_height) = match self.dimensions.as_deref() {
            Some(dims) if !dims.trim().is_empty() => {
                let (w, h) = parse_dimensions(dims)?;
                (Some(w), Some(h))
            }
            _ => (None, None),
        };

        Ok(VideoFormat {
            id: FormatId::new(),
            name,
            video_codec: Some(self.video_codec.unwrap_or_else(|| DEFAULT_VIDEO_CODEC.to_string())),
            audio_codec: Some(self.audio_codec.unwrap_or_else(|| DEFAULT_AUDIO_CODEC.to_string())),
            video_width,
            video_height,
            audio_sample_rate: self.audio_sample_rate,
            audio_bit_rate: self.audio_bit_rate,
            video_bit_rate: self.video_bit_rate,
            created_at: Utc::now(),
        })
    }
}

/// Parse `WxH` into `(width, height)`.
pub fn parse_dimensions(dims: &str) -> Result<(u32, u32), FormatError> {
    let invalid = || FormatError::InvalidDimensions(dims.to_string());
    let (w, h) = dims.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
    let w: u32 = w.trim().parse().map_err(|_| invalid())?;
    let h: u32 = h.trim().parse().map_err(|_| invalid())?;
    if w == 0 || h == 0 {
        return Err(invalid());
    }
    Ok((w, h))
}
