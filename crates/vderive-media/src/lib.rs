//! FFmpeg/FFprobe wrapper for the conversion worker.
//!
//! This crate provides:
//! - FFmpeg command building and execution with cancellation/timeout
//! - FFprobe metadata extraction with fallback probes
//! - Execution of convert commands in a job working directory

pub mod command;
pub mod convert;
pub mod error;
pub mod probe;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use convert::{encoder_for, find_input, frame_file_name, run_convert, ConvertOutput, META_FILE};
pub use error::{MediaError, MediaResult};
pub use probe::{metadata_from_probe, probe_metadata, FfprobeOutput};
