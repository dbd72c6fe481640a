//! Command encoding shared by the planner and the convert helper.
//!
//! A job carries one of three commands:
//!
//! ```text
//! analyze
//! extract <numFrames>
//! transcode <FLAG value>... <extension>
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error decoding a command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertParseError {
    #[error("Missing command")]
    MissingCommand,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid frame count: {0}")]
    InvalidFrameCount(String),

    #[error("Unknown transcode flag: {0}")]
    UnknownFlag(String),

    #[error("Missing value for flag {0}")]
    MissingValue(String),

    #[error("Missing output extension")]
    MissingExtension,
}

/// One transcode target parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TranscodeFlag {
    #[serde(rename = "VCODEC")]
    VideoCodec,
    #[serde(rename = "ACODEC")]
    AudioCodec,
    #[serde(rename = "DIMENSIONS")]
    Dimensions,
    #[serde(rename = "ASRATE")]
    AudioSampleRate,
    #[serde(rename = "ABRATE")]
    AudioBitRate,
    #[serde(rename = "VBRATE")]
    VideoBitRate,
}

impl TranscodeFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeFlag::VideoCodec => "VCODEC",
            TranscodeFlag::AudioCodec => "ACODEC",
            TranscodeFlag::Dimensions => "DIMENSIONS",
            TranscodeFlag::AudioSampleRate => "ASRATE",
            TranscodeFlag::AudioBitRate => "ABRATE",
            TranscodeFlag::VideoBitRate => "VBRATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VCODEC" => Some(TranscodeFlag::VideoCodec),
            "ACODEC" => Some(TranscodeFlag::AudioCodec),
            "DIMENSIONS" => Some(TranscodeFlag::Dimensions),
            "ASRATE" => Some(TranscodeFlag::AudioSampleRate),
            "ABRATE" => Some(TranscodeFlag::AudioBitRate),
            "VBRATE" => Some(TranscodeFlag::VideoBitRate),
            _ => None,
        }
    }
}

impl fmt::Display for TranscodeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the convert helper should do with `input.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ConvertCommand {
    /// Probe and write `meta.json`
    Analyze,
    /// Write `1.png` .. `<frames>.png`
    Extract { frames: u64 },
    /// Write `output.<extension>`
    Transcode {
        params: Vec<(TranscodeFlag, String)>,
        extension: String,
    },
}

impl ConvertCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ConvertCommand::Analyze => "analyze",
            ConvertCommand::Extract { .. } => "extract",
            ConvertCommand::Transcode { .. } => "transcode",
        }
    }

    /// Encode as helper command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            ConvertCommand::Analyze => {}
            ConvertCommand::Extract { frames } => args.push(frames.to_string()),
            ConvertCommand::Transcode { params, extension } => {
                for (flag, value) in params {
                    args.push(flag.as_str().to_string());
                    args.push(value.clone());
                }
                args.push(extension.clone());
            }
        }
        args
    }

    /// Decode helper command-line arguments.
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ConvertParseError> {
        let (command, rest) = args.split_first().ok_or(ConvertParseError::MissingCommand)?;

        match command.as_ref() {
            "analyze" => Ok(ConvertCommand::Analyze),
            "extract" => {
                let raw = rest
                    .first()
                    .map(|s| s.as_ref().to_string())
                    .ok_or_else(|| ConvertParseError::InvalidFrameCount(String::new()))?;
                let frames = raw
                    .parse()
                    .map_err(|_| ConvertParseError::InvalidFrameCount(raw.clone()))?;
                Ok(ConvertCommand::Extract { frames })
            }
            "transcode" => {
                let (extension, pairs) = rest.split_last().ok_or(ConvertParseError::MissingExtension)?;
                if TranscodeFlag::parse(extension.as_ref()).is_some() {
                    return Err(ConvertParseError::MissingExtension);
                }

                let mut params = Vec::with_capacity(pairs.len() / 2);
                let mut iter = pairs.iter();
                while let Some(flag) = iter.next() {
                    let flag = flag.as_ref();
                    let parsed = TranscodeFlag::parse(flag)
                        .ok_or_else(|| ConvertParseError::UnknownFlag(flag.to_string()))?;
                    let value = iter
                        .next()
                        .ok_or_else(|| ConvertParseError::MissingValue(flag.to_string()))?;
                    params.push((parsed, value.as_ref().to_string()));
                }

                Ok(ConvertCommand::Transcode {
                    params,
                    extension: extension.as_ref().to_string(),
                })
            }
            other => Err(ConvertParseError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcode_args() {
        let cmd = ConvertCommand::parse_args(&["transcode", "VCODEC", "VP9", "DIMENSIONS", "640x360", "webm"])
            .unwrap();
        assert_eq!(
            cmd,
            ConvertCommand::Transcode {
                params: vec![
                    (TranscodeFlag::VideoCodec, "VP9".into()),
                    (TranscodeFlag::Dimensions, "640x360".into()),
                ],
                extension: "webm".into(),
            }
        );
        assert_eq!(cmd.to_args()[0], "transcode");
    }

    #[test]
    fn test_parse_extract_and_analyze() {
        assert_eq!(ConvertCommand::parse_args(&["analyze"]).unwrap(), ConvertCommand::Analyze);
        assert_eq!(
            ConvertCommand::parse_args(&["extract", "12"]).unwrap(),
            ConvertCommand::Extract { frames: 12 }
        );
        assert_eq!(ConvertCommand::Extract { frames: 3 }.to_args(), vec!["extract", "3"]);
    }

    #[test]
    fn test_parse_errors() {
        let empty: [&str; 0] = [];
        assert_eq!(ConvertCommand::parse_args(&empty), Err(ConvertParseError::MissingCommand));
        assert!(matches!(
            ConvertCommand::parse_args(&["extract", "many"]),
            Err(ConvertParseError::InvalidFrameCount(_))
        ));
        assert!(matches!(
            ConvertCommand::parse_args(&["transcode", "FOO", "1", "webm"]),
            Err(ConvertParseError::UnknownFlag(_))
        ));
        assert!(matches!(
            ConvertCommand::parse_args(&["transcode", "VCODEC", "webm"]),
            Err(ConvertParseError::MissingValue(_))
        ));
        assert!(matches!(
            ConvertCommand::parse_args(&["burn"]),
            Err(ConvertParseError::UnknownCommand(_))
        ));
    }
}
