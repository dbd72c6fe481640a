//! Job executor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use vderive_models::JobStatus;
use vderive_queue::{
    CompletedOutput, CompletionSink, FailureDisposition, JobCompletion, JobQueue, JobSource,
    QueuedJob,
};
use vderive_storage::FileStore;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::runner::ConvertRunner;

/// How a job ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Outputs uploaded and the completion delivered
    Completed { outputs: usize },
    /// Canceled before it started
    Skipped,
    /// Canceled while running; uploads were discarded
    Discarded,
}

/// Everything a running job needs.
struct JobContext {
    source: Arc<dyn JobSource>,
    sink: Arc<dyn CompletionSink>,
    files: Arc<dyn FileStore>,
    runner: Arc<dyn ConvertRunner>,
    work_dir: PathBuf,
    cancel_poll_interval: Duration,
}

/// Job executor that processes jobs from a [`JobSource`].
pub struct JobExecutor {
    config: WorkerConfig,
    ctx: Arc<JobContext>,
    claimer: Option<Arc<JobQueue>>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn JobSource>,
        sink: Arc<dyn CompletionSink>,
        files: Arc<dyn FileStore>,
        runner: Arc<dyn ConvertRunner>,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(JobContext {
            source,
            sink,
            files,
            runner,
            work_dir: config.work_dir.clone(),
            cancel_poll_interval: config.cancel_poll_interval,
        });

        Self {
            config,
            ctx,
            claimer: None,
            job_semaphore,
            shutdown,
        }
    }

    /// Reclaim jobs left pending by crashed workers of this queue.
    pub fn with_claimer(mut self, queue: Arc<JobQueue>) -> Self {
        self.claimer = Some(queue);
        self
    }

    /// Start the executor.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor with {} max concurrent jobs",
            self.config.max_concurrent_jobs
        );

        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        let claim_task = self.claimer.clone().map(|queue| {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&self.job_semaphore);
            let mut shutdown_rx_claim = self.shutdown.subscribe();
            let claim_interval = self.config.claim_interval;
            let min_idle = self.config.claim_min_idle;

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(claim_interval);
                loop {
                    tokio::select! {
                        _ = shutdown_rx_claim.changed() => {
                            if *shutdown_rx_claim.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            match queue.claim_pending(min_idle, 5).await {
                                Ok(jobs) if !jobs.is_empty() => {
                                    info!("Claimed {} pending jobs", jobs.len());
                                    for job in jobs {
                                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                            break;
                                        };
                                        let ctx = Arc::clone(&ctx);
                                        tokio::spawn(async move {
                                            let _permit = permit;
                                            Self::execute_job(ctx, job).await;
                                        });
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("Failed to claim pending jobs: {}", e);
                                }
                            }
                        }
                    }
                }
            })
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        if let Some(task) = claim_task {
            task.abort();
        }

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with jobs still running");
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Consume and start jobs up to the free capacity.
    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self.ctx.source.next_jobs(available.min(5)).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", jobs.len());

        for job in jobs {
            let ctx = Arc::clone(&self.ctx);
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, job).await;
            });
        }

        Ok(())
    }

    /// Run one job to the end, including ack/fail bookkeeping.
    pub async fn execute_one(&self, job: QueuedJob) -> WorkerResult<JobOutcome> {
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
        Self::finish_job(&self.ctx, &job, Self::process_job(&self.ctx, &job).await).await
    }

    async fn execute_job(ctx: Arc<JobContext>, job: QueuedJob) {
        let result = Self::process_job(&ctx, &job).await;
        if let Err(e) = Self::finish_job(&ctx, &job, result).await {
            debug!(job_id = %job.job_id, "Job ended with error: {}", e);
        }
    }

    /// Ack or fail the delivery according to `result`.
    async fn finish_job(
        ctx: &JobContext,
        job: &QueuedJob,
        result: WorkerResult<(JobOutcome, Duration)>,
    ) -> WorkerResult<JobOutcome> {
        let kind = job.spec.kind;

        match result {
            Ok((outcome, elapsed)) => {
                let label = match outcome {
                    JobOutcome::Completed { .. } => "success",
                    JobOutcome::Skipped | JobOutcome::Discarded => "canceled",
                };
                metrics::record_job(kind, label, elapsed);
                if let Err(e) = ctx.source.ack(job).await {
                    error!("Failed to ack job {}: {}", job.job_id, e);
                }
                Ok(outcome)
            }
            Err(e) => {
                JobLogger::new(&job.job_id, kind).log_error(&e.to_string());
                metrics::record_job(kind, "error", Duration::ZERO);

                match ctx.source.fail(job, &e.to_string()).await {
                    Ok(FailureDisposition::Retrying { attempt }) => {
                        info!("Job {} will be retried (attempt {})", job.job_id, attempt);
                    }
                    Ok(FailureDisposition::DeadLettered) => {
                        warn!("Job {} gave up", job.job_id);
                    }
                    Err(fail_err) => {
                        error!("Failed to record failure of job {}: {}", job.job_id, fail_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn process_job(ctx: &JobContext, job: &QueuedJob) -> WorkerResult<(JobOutcome, Duration)> {
        let logger = JobLogger::new(&job.job_id, job.spec.kind);
        let span = logger.create_span();
        let started = Instant::now();

        let outcome = Self::run_job(ctx, job, &logger).instrument(span).await?;
        Ok((outcome, started.elapsed()))
    }

    async fn run_job(ctx: &JobContext, job: &QueuedJob, logger: &JobLogger) -> WorkerResult<JobOutcome> {
        let spec = &job.spec;

        if ctx.source.job_status(&job.job_id).await? == Some(JobStatus::Canceled) {
            logger.log_warning("canceled before start, skipping");
            return Ok(JobOutcome::Skipped);
        }

        logger.log_start(&spec.title);
        ctx.source.set_status(&job.job_id, JobStatus::Running).await?;

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("vderive-job-")
            .tempdir_in(&ctx.work_dir)?;

        ctx.files
            .download_to(&spec.input.file_id, &dir.path().join(&spec.input.name))
            .await?;
        logger.log_progress(&format!("downloaded {}", spec.input.name));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let watcher = {
            let source = Arc::clone(&ctx.source);
            let job_id = job.job_id.clone();
            let poll = ctx.cancel_poll_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(poll).await;
                    if let Ok(Some(JobStatus::Canceled)) = source.job_status(&job_id).await {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                }
            })
        };
        let run = ctx.runner.run(dir.path(), &spec.command, cancel_rx).await;
        watcher.abort();
        match run {
            Err(WorkerError::Canceled) => {
                logger.log_warning("canceled while running");
                return Ok(JobOutcome::Discarded);
            }
            other => other?,
        }

        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for output in &spec.outputs {
            let path = dir.path().join(&output.path);
            if !tokio::fs::try_exists(&path).await? {
                if output.optional {
                    logger.log_warning(&format!("output {} not produced, skipping", output.path));
                    continue;
                }
                Self::discard(ctx, &outputs).await;
                return Err(WorkerError::MissingOutput(output.path.clone()));
            }

            let stored = ctx.files.save(&path, &output.name).await?;
            outputs.push(CompletedOutput {
                file_id: stored.id,
                name: output.name.clone(),
                reference: output.reference.clone(),
            });
        }

        if ctx.source.job_status(&job.job_id).await? == Some(JobStatus::Canceled) {
            logger.log_warning("canceled after run, discarding outputs");
            Self::discard(ctx, &outputs).await;
            return Ok(JobOutcome::Discarded);
        }

        let count = outputs.len();
        ctx.sink
            .deliver(JobCompletion::new(job.job_id.clone(), spec.kind, outputs))
            .await?;

        // Delivered: from here on the job must not be failed or retried.
        if let Err(e) = ctx.source.set_status(&job.job_id, JobStatus::Success).await {
            logger.log_warning(&format!("delivered but failed to record success: {}", e));
        }

        logger.log_completion(&format!("{} outputs delivered", count));
        Ok(JobOutcome::Completed { outputs: count })
    }

    async fn discard(ctx: &JobContext, outputs: &[CompletedOutput]) {
        for output in outputs {
            if let Err(e) = ctx.files.remove(&output.file_id).await {
                warn!(file_id = %output.file_id, error = %e, "Failed to discard output");
            }
        }
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::sync::Mutex;
    use chrono::Utc;
    use vderive_models::{ConvertCommand, DerivationType, FileId, JobId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vderive_queue::{
        JobDispatcher, JobInput, JobOutput, JobSpec, LocalQueue, QueueError, QueueResult,
    };
    use vderive_storage::LocalFileStore;

    /// Writes the files a command would produce, without FFmpeg.
    struct FakeRunner {
        frames_written: u64,
    }

    #[async_trait]
    impl ConvertRunner for FakeRunner {
        async fn run(
            &self,
            dir: &Path,
            command: &ConvertCommand,
            _cancel: watch::Receiver<bool>,
        ) -> WorkerResult<()> {
            assert!(tokio::fs::try_exists(dir.join("input.mp4")).await?);
            match command {
                ConvertCommand::Analyze => {
                    tokio::fs::write(dir.join("meta.json"), br#"{"videoFrameCount": 3, "duration": 1.5}"#)
                        .await?;
                }
                ConvertCommand::Extract { .. } => {
                    for n in 1..=self.frames_written {
                        tokio::fs::write(dir.join(format!("{}.png", n)), b"png").await?;
                    }
                }
                ConvertCommand::Transcode { .. } => {}
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<JobCompletion>>,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn deliver(&self, completion: JobCompletion) -> QueueResult<()> {
            self.delivered.lock().await.push(completion);
            Ok(())
        }
    }

    /// Local queue whose `Success` writes fail; counts `fail` calls.
    struct SuccessWriteFails {
        inner: Arc<LocalQueue>,
        failed: AtomicUsize,
    }

    #[async_trait]
    impl JobSource for SuccessWriteFails {
        async fn next_jobs(&self, max: usize) -> QueueResult<Vec<QueuedJob>> {
            self.inner.next_jobs(max).await
        }

        async fn ack(&self, job: &QueuedJob) -> QueueResult<()> {
            self.inner.ack(job).await
        }

        async fn fail(&self, job: &QueuedJob, error: &str) -> QueueResult<FailureDisposition> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.inner.fail(job, error).await
        }

        async fn set_status(&self, job_id: &JobId, status: JobStatus) -> QueueResult<()> {
            if status == JobStatus::Success {
                return Err(QueueError::connection_failed("status store unavailable"));
            }
            self.inner.set_status(job_id, status).await
        }

        async fn job_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatus>> {
            self.inner.job_status(job_id).await
        }
    }

    struct Fixture {
        executor: JobExecutor,
        queue: Arc<LocalQueue>,
        files: Arc<LocalFileStore>,
        sink: Arc<RecordingSink>,
        source: FileId,
        _dir: tempfile::TempDir,
    }

    async fn fixture(frames_written: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(LocalFileStore::new(dir.path().join("files")).await.unwrap());
        let source = files.save_bytes(b"video".to_vec(), "clip.mp4").await.unwrap().id;
        let queue = Arc::new(LocalQueue::with_poll_interval(Duration::from_millis(20)));
        let sink = Arc::new(RecordingSink::default());

        let config = WorkerConfig {
            work_dir: dir.path().join("work"),
            ..WorkerConfig::default()
        };
        let executor = JobExecutor::new(
            config,
            queue.clone(),
            sink.clone(),
            files.clone(),
            Arc::new(FakeRunner { frames_written }),
        );

        Fixture {
            executor,
            queue,
            files,
            sink,
            source,
            _dir: dir,
        }
    }

    fn spec(source: &FileId, command: ConvertCommand, outputs: Vec<JobOutput>) -> JobSpec {
        let kind = match &command {
            ConvertCommand::Analyze => DerivationType::Analysis,
            ConvertCommand::Extract { .. } => DerivationType::FrameExtraction,
            ConvertCommand::Transcode { .. } => DerivationType::Transcoding,
        };
        JobSpec {
            title: "[video] test".into(),
            kind,
            input: JobInput::new(source.clone(), Some("mp4")),
            command,
            outputs,
            staging: None,
            created_at: Utc::now(),
        }
    }

    async fn next(queue: &LocalQueue) -> QueuedJob {
        queue.next_jobs(1).await.unwrap().pop().unwrap()
    }

    #[tokio::test]
    async fn test_analysis_job_uploads_and_delivers() {
        let f = fixture(0).await;
        let job_id = f
            .queue
            .submit(spec(
                &f.source,
                ConvertCommand::Analyze,
                vec![JobOutput::required("meta.json", "meta.json", "ref-meta")],
            ))
            .await
            .unwrap();

        let outcome = f.executor.execute_one(next(&f.queue).await).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { outputs: 1 });
        assert_eq!(f.queue.status(&job_id).await.unwrap(), Some(JobStatus::Success));

        let delivered = f.sink.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].job_id, job_id);
        assert_eq!(delivered[0].outputs[0].reference, "ref-meta");

        let bytes = f.files.read(&delivered[0].outputs[0].file_id).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("videoFrameCount"));
    }

    #[tokio::test]
    async fn test_missing_optional_frames_are_skipped() {
        let f = fixture(2).await;
        let outputs = (0..4)
            .map(|i| JobOutput::optional(format!("{}.png", i + 1), format!("{}.png", i), format!("ref-{}", i)))
            .collect();
        f.queue
            .submit(spec(&f.source, ConvertCommand::Extract { frames: 4 }, outputs))
            .await
            .unwrap();

        let outcome = f.executor.execute_one(next(&f.queue).await).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { outputs: 2 });

        let delivered = f.sink.delivered.lock().await;
        let refs: Vec<_> = delivered[0].outputs.iter().map(|o| o.reference.as_str()).collect();
        assert_eq!(refs, vec!["ref-0", "ref-1"]);
    }

    #[tokio::test]
    async fn test_missing_required_output_fails_job() {
        let f = fixture(0).await;
        let job_id = f
            .queue
            .submit(spec(
                &f.source,
                ConvertCommand::Transcode {
                    params: Vec::new(),
                    extension: "webm".into(),
                },
                vec![JobOutput::required("output.webm", "clip.webm", "ref")],
            ))
            .await
            .unwrap();

        let err = f.executor.execute_one(next(&f.queue).await).await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingOutput(ref p) if p == "output.webm"));
        assert_eq!(f.queue.status(&job_id).await.unwrap(), Some(JobStatus::Error));
        assert!(f.sink.delivered.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_canceled_job_is_skipped() {
        let f = fixture(0).await;
        let job_id = f
            .queue
            .submit(spec(&f.source, ConvertCommand::Analyze, Vec::new()))
            .await
            .unwrap();
        let job = next(&f.queue).await;
        f.queue.set_status(&job_id, JobStatus::Canceled).await.unwrap();

        let outcome = tokio_test::assert_ok!(f.executor.execute_one(job).await);
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(f.sink.delivered.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(0).await;
        let executor = Arc::new(f.executor);

        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run().await }
        });
        f.queue
            .submit(spec(
                &f.source,
                ConvertCommand::Analyze,
                vec![JobOutput::required("meta.json", "meta.json", "ref")],
            ))
            .await
            .unwrap();

        for _ in 0..100 {
            if !f.sink.delivered.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        executor.shutdown();
        tokio_test::assert_ok!(handle.await.unwrap());

        assert_eq!(f.sink.delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delivered_job_is_not_failed_when_success_write_fails() {
        let f = fixture(0).await;
        let source = Arc::new(SuccessWriteFails {
            inner: f.queue.clone(),
            failed: AtomicUsize::new(0),
        });
        let executor = JobExecutor::new(
            WorkerConfig {
                work_dir: f._dir.path().join("work"),
                ..WorkerConfig::default()
            },
            source.clone(),
            f.sink.clone(),
            f.files.clone(),
            Arc::new(FakeRunner { frames_written: 0 }),
        );
        let job_id = f
            .queue
            .submit(spec(
                &f.source,
                ConvertCommand::Analyze,
                vec![JobOutput::required("meta.json", "meta.json", "ref")],
            ))
            .await
            .unwrap();

        let outcome = executor.execute_one(next(&f.queue).await).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { outputs: 1 });
        assert_eq!(source.failed.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.delivered.lock().await.len(), 1);
        assert_eq!(f.queue.status(&job_id).await.unwrap(), Some(JobStatus::Running));
        assert_eq!(f.queue.pending_len().await, 0);
    }
}
