//! Execution of a convert command inside a job's working directory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use vderive_media::{run_convert, FfmpegRunner};
use vderive_models::ConvertCommand;

use crate::error::WorkerResult;

/// Runs a convert command against the `input.*` file in `dir`, leaving the
/// outputs next to it. Flipping `cancel` to `true` aborts the run.
#[async_trait]
pub trait ConvertRunner: Send + Sync {
    async fn run(
        &self,
        dir: &Path,
        command: &ConvertCommand,
        cancel: watch::Receiver<bool>,
    ) -> WorkerResult<()>;
}

/// FFmpeg/FFprobe backed runner.
#[derive(Debug, Clone)]
pub struct FfmpegConvertRunner {
    timeout: Duration,
}

impl FfmpegConvertRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConvertRunner for FfmpegConvertRunner {
    async fn run(
        &self,
        dir: &Path,
        command: &ConvertCommand,
        cancel: watch::Receiver<bool>,
    ) -> WorkerResult<()> {
        let runner = FfmpegRunner::new()
            .with_timeout(self.timeout)
            .with_cancel(cancel);
        run_convert(dir, command, &runner).await?;
        Ok(())
    }
}
