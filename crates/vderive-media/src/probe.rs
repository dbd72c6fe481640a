//! FFprobe metadata extraction.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use vderive_models::VideoMetadata;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// Duration differences below this are not corrected.
const DURATION_TOLERANCE: f64 = 0.1;

/// Frame rate differences below this are not corrected.
const FRAME_RATE_TOLERANCE: f64 = 0.01;

/// FFprobe JSON output format.
#[derive(Debug, Default, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub format: Option<FfprobeFormat>,
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FfprobeStream {
    #[serde(default)]
    pub codec_type: String,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub bit_rate: Option<String>,
    pub duration: Option<String>,
    pub sample_rate: Option<String>,
    pub sample_fmt: Option<String>,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
}

impl FfprobeOutput {
    fn first_stream(&self, codec_type: &str) -> Option<&FfprobeStream> {
        self.streams.iter().find(|s| s.codec_type == codec_type)
    }
}

/// Probe a video file, filling gaps with targeted follow-up probes.
pub async fn probe_metadata(path: impl AsRef<Path>) -> MediaResult<VideoMetadata> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }
    check_ffprobe()?;

    let stdout = run_ffprobe(&[
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ], path)
    .await?;
    let probe: FfprobeOutput = serde_json::from_slice(&stdout)?;

    let has_audio = probe.first_stream("audio").is_some();
    let mut meta = stream_metadata(&probe)?;

    if has_audio && meta.audio_bit_rate.is_none() {
        debug!("Audio bit rate missing, probing stream");
        meta.audio_bit_rate = probe_entry(path, "a:0", "stream=bit_rate", false)
            .await?
            .and_then(|v| v.parse().ok());
    }

    if meta.video_bit_rate.is_none() {
        debug!("Video bit rate missing, probing stream");
        meta.video_bit_rate = probe_entry(path, "v:0", "stream=bit_rate", false)
            .await?
            .and_then(|v| v.parse().ok());
    }

    if meta.video_frame_count.is_none() {
        debug!("Frame count missing, counting frames");
        meta.video_frame_count = probe_entry(path, "v:0", "stream=nb_read_frames", true)
            .await?
            .and_then(|v| v.parse().ok());
    }

    reconcile(&mut meta, probe.format.as_ref());
    Ok(meta)
}

/// Build metadata from a full probe report without follow-up probes.
pub fn metadata_from_probe(probe: &FfprobeOutput) -> MediaResult<VideoMetadata> {
    let mut meta = stream_metadata(probe)?;
    reconcile(&mut meta, probe.format.as_ref());
    Ok(meta)
}

fn stream_metadata(probe: &FfprobeOutput) -> MediaResult<VideoMetadata> {
    let video = probe
        .first_stream("video")
        .ok_or_else(|| MediaError::invalid_video("No video stream found"))?;
    let audio = probe.first_stream("audio");

    let video_frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate));

    Ok(VideoMetadata {
        duration: parse_num(&video.duration),
        video_width: video.width,
        video_height: video.height,
        video_frame_rate,
        video_frame_count: parse_num(&video.nb_frames),
        video_bit_rate: parse_num(&video.bit_rate),
        video_codec: video.codec_name.clone(),
        audio_bit_rate: audio.and_then(|a| parse_num(&a.bit_rate)),
        audio_sample_rate: audio.and_then(|a| parse_num(&a.sample_rate)),
        audio_sample_format: audio.and_then(|a| a.sample_fmt.clone()),
        audio_channel_count: audio.and_then(|a| a.channels),
        audio_channel_layout: audio.and_then(|a| a.channel_layout.clone()),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
    })
}

/// Cross-check stream values against the container.
///
/// The container duration (`duration - start_time`) wins when the stream
/// lacks one or they differ by at least [`DURATION_TOLERANCE`]; the frame
/// rate is then recomputed from frame count and duration the same way.
fn reconcile(meta: &mut VideoMetadata, format: Option<&FfprobeFormat>) {
    let Some(format) = format else {
        return;
    };

    let start: Option<f64> = parse_num(&format.start_time);
    let end: Option<f64> = parse_num(&format.duration);

    if let (Some(start), Some(end)) = (start, end) {
        let other = end - start;
        let replace = match meta.duration {
            None => true,
            Some(current) => other > 0.0 && (current - other).abs() >= DURATION_TOLERANCE,
        };
        if replace {
            meta.duration = Some(other);
        }
    }

    if let (Some(count), Some(duration)) = (meta.video_frame_count, meta.duration) {
        if duration > 0.0 {
            let other = count as f64 / duration;
            let replace = match meta.video_frame_rate {
                None => true,
                Some(current) => other > 0.0 && (current - other).abs() >= FRAME_RATE_TOLERANCE,
            };
            if replace {
                meta.video_frame_rate = Some(other);
            }
        }
    }
}

fn parse_num<T: std::str::FromStr>(value: &Option<String>) -> Option<T> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

/// Parse frame rate string (e.g., "30/1" or "29.97").
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

async fn run_ffprobe(args: &[&str], path: &Path) -> MediaResult<Vec<u8>> {
    let output = Command::new("ffprobe")
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::ffprobe_failed(
            "FFprobe failed",
            Some(String::from_utf8_lossy(&output.stderr).to_string()),
        ));
    }

    Ok(output.stdout)
}

/// Read a single entry for one stream.
async fn probe_entry(
    path: &Path,
    stream: &str,
    entry: &str,
    count_frames: bool,
) -> MediaResult<Option<String>> {
    let mut args = vec!["-v", "error"];
    if count_frames {
        args.push("-count_frames");
    }
    args.extend([
        "-select_streams",
        stream,
        "-show_entries",
        entry,
        "-of",
        "default=nokey=1:noprint_wrappers=1",
    ]);

    let stdout = run_ffprobe(&args, path).await?;
    let value = String::from_utf8_lossy(&stdout).trim().to_string();
    Ok(Some(value).filter(|v| !v.is_empty() && v != "N/A"))
}
