//! Convert commands executed inside a job working directory.
//!
//! The directory holds exactly one `input.*` file. Outputs land next to it:
//! `meta.json` for analysis, `1.png`..`N.png` for extraction and
//! `output.<ext>` for transcoding.

use std::path::{Path, PathBuf};

use tracing::info;
use vderive_models::{ConvertCommand, TranscodeFlag, VideoMetadata};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_metadata;

/// Analysis output file name.
pub const META_FILE: &str = "meta.json";

/// What a convert command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertOutput {
    Metadata(VideoMetadata),
    Frames(u64),
    Rendition(PathBuf),
}

/// Map a format codec name to the FFmpeg encoder.
pub fn encoder_for(codec: &str) -> String {
    match codec.to_ascii_uppercase().as_str() {
        "VP9" => "libvpx-vp9".to_string(),
        "OPUS" => "libopus".to_string(),
        "H264" => "libx264".to_string(),
        "AAC" => "aac".to_string(),
        _ => codec.to_string(),
    }
}

/// Frame image path for a 1-based frame number.
pub fn frame_file_name(number: u64) -> String {
    format!("{}.png", number)
}

/// Locate the `input.*` file in `dir`.
pub async fn find_input(dir: &Path) -> MediaResult<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "input" || name.starts_with("input.") {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::InputNotFound(dir.to_path_buf()))
}

/// Build the transcode invocation.
pub fn transcode_command(
    input: &Path,
    dir: &Path,
    params: &[(TranscodeFlag, String)],
    extension: &str,
) -> FfmpegCommand {
    let value = |flag: TranscodeFlag| {
        params
            .iter()
            .rev()
            .find(|(f, _)| *f == flag)
            .map(|(_, v)| v.as_str())
    };

    let output = dir.join(format!("output.{}", extension));
    let mut cmd = FfmpegCommand::new(input, output);

    if let Some(dims) = value(TranscodeFlag::Dimensions) {
        cmd = cmd.dimensions(dims);
    }

    let video_encoder = value(TranscodeFlag::VideoCodec).map(encoder_for);
    if video_encoder.as_deref().is_some_and(|e| e.starts_with("libvpx")) {
        cmd = cmd.output_args(["-quality", "good"]);
    }
    cmd = cmd.output_args(["-threads", "0"]);

    if let Some(encoder) = video_encoder {
        cmd = cmd.video_codec(encoder);
    }
    cmd = cmd.crf(5);

    if let Some(rate) = value(TranscodeFlag::VideoBitRate) {
        cmd = cmd.video_bitrate(rate);
    }
    if let Some(codec) = value(TranscodeFlag::AudioCodec) {
        cmd = cmd.audio_codec(encoder_for(codec));
    }
    if let Some(rate) = value(TranscodeFlag::AudioSampleRate) {
        cmd = cmd.audio_sample_rate(rate);
    }
    if let Some(rate) = value(TranscodeFlag::AudioBitRate) {
        cmd = cmd.audio_bitrate(rate);
    }

    cmd.output_args(["-g", "30", "-bf", "2"])
}

/// Build the frame extraction invocation.
pub fn extract_command(input: &Path, dir: &Path, frames: u64) -> FfmpegCommand {
    FfmpegCommand::new(input, dir.join("%d.png")).max_frames(frames)
}

/// Run `command` against the input in `dir`.
pub async fn run_convert(
    dir: &Path,
    command: &ConvertCommand,
    runner: &FfmpegRunner,
) -> MediaResult<ConvertOutput> {
    let input = find_input(dir).await?;
    info!(command = command.name(), input = %input.display(), "Running convert command");

    match command {
        ConvertCommand::Analyze => {
            let meta = probe_metadata(&input).await?;
            let json = serde_json::to_vec_pretty(&meta)?;
            tokio::fs::write(dir.join(META_FILE), json).await?;
            Ok(ConvertOutput::Metadata(meta))
        }
        ConvertCommand::Extract { frames } => {
            runner.run(&extract_command(&input, dir, *frames)).await?;
            let mut produced = 0;
            for number in 1..=*frames {
                if !tokio::fs::try_exists(dir.join(frame_file_name(number))).await? {
                    break;
                }
                produced = number;
            }
            info!(requested = frames, produced, "Extracted frames");
            Ok(ConvertOutput::Frames(produced))
        }
        ConvertCommand::Transcode { params, extension } => {
            let cmd = transcode_command(&input, dir, params, extension);
            runner.run(&cmd).await?;
            Ok(ConvertOutput::Rendition(dir.join(format!("output.{}", extension))))
        }
    }
}
