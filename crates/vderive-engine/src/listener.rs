//! Feeds completions published by remote workers into a [`CompletionSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vderive_queue::{CompletionSink, JobCompletion, JobQueue, QueueResult};

/// Source of published completions, acknowledged one by one.
#[async_trait]
pub trait CompletionStream: Send + Sync {
    async fn next_completions(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>>;

    /// Completions handed out before but never acknowledged.
    async fn unacknowledged(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>>;

    async fn ack(&self, message_id: &str) -> QueueResult<()>;
}

#[async_trait]
impl CompletionStream for JobQueue {
    async fn next_completions(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
        self.consume_completions(max).await
    }

    async fn unacknowledged(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
        self.recover_completions(max).await
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        self.ack_completion(message_id).await
    }
}

pub struct CompletionListener {
    stream: Arc<dyn CompletionStream>,
    sink: Arc<dyn CompletionSink>,
    batch_size: usize,
    recover_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl CompletionListener {
    pub fn new(
        stream: Arc<dyn CompletionStream>,
        sink: Arc<dyn CompletionSink>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            sink,
            batch_size: 16,
            recover_interval: Duration::from_secs(60),
            shutdown_rx,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_recover_interval(mut self, interval: Duration) -> Self {
        self.recover_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run until shutdown is signalled.
    ///
    /// Unacknowledged completions are handled first, then again on every
    /// recovery tick.
    pub async fn run(mut self) {
        info!("Starting completion listener");

        // The first tick fires immediately.
        let mut recover = tokio::time::interval(self.recover_interval);
        recover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Completion listener shutting down");
                        break;
                    }
                }
                _ = recover.tick() => {
                    self.recover().await;
                }
                result = self.stream.next_completions(self.batch_size) => {
                    match result {
                        Ok(batch) => {
                            for (message_id, completion) in batch {
                                self.handle(&message_id, completion).await;
                            }
                        }
                        Err(e) => {
                            error!("Failed to consume completions: {}", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn recover(&self) {
        loop {
            match self.stream.unacknowledged(self.batch_size).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    debug!(count = batch.len(), "Handling unacknowledged completions");
                    for (message_id, completion) in batch {
                        self.handle(&message_id, completion).await;
                    }
                }
                Err(e) => {
                    error!("Failed to recover completions: {}", e);
                    break;
                }
            }
        }
    }

    /// Deliver one completion and acknowledge it, rejected or not.
    async fn handle(&self, message_id: &str, completion: JobCompletion) {
        let job_id = completion.job_id.clone();
        match self.sink.deliver(completion).await {
            Ok(()) => debug!(job_id = %job_id, message_id, "Completion delivered"),
            Err(e) => warn!(job_id = %job_id, message_id, error = %e, "Completion rejected"),
        }

        if let Err(e) = self.stream.ack(message_id).await {
            warn!(message_id, error = %e, "Failed to acknowledge completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use vderive_models::{DerivationType, JobId};
    use vderive_queue::QueueError;

    #[derive(Default)]
    struct FakeStream {
        pending: Mutex<Vec<(String, JobCompletion)>>,
        unacked: Mutex<Vec<(String, JobCompletion)>>,
        acked: Mutex<Vec<String>>,
    }

    fn completion(message: &str, job: &str) -> (String, JobCompletion) {
        (
            message.to_string(),
            JobCompletion::new(JobId::from(job), DerivationType::Analysis, Vec::new()),
        )
    }

    #[async_trait]
    impl CompletionStream for FakeStream {
        async fn next_completions(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
            let mut pending = self.pending.lock().await;
            let n = max.min(pending.len());
            let batch: Vec<_> = pending.drain(..n).collect();
            if batch.is_empty() {
                drop(pending);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(batch)
        }

        async fn unacknowledged(&self, max: usize) -> QueueResult<Vec<(String, JobCompletion)>> {
            let mut unacked = self.unacked.lock().await;
            let n = max.min(unacked.len());
            Ok(unacked.drain(..n).collect())
        }

        async fn ack(&self, message_id: &str) -> QueueResult<()> {
            self.acked.lock().await.push(message_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn deliver(&self, completion: JobCompletion) -> QueueResult<()> {
            self.seen.lock().await.push(completion.job_id.clone());
            if completion.job_id.as_str() == "bad" {
                return Err(QueueError::completion_rejected("bad"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivers_and_acks_every_completion() {
        let stream = Arc::new(FakeStream::default());
        for (message, job) in [("1-0", "good"), ("2-0", "bad")] {
            stream.pending.lock().await.push(completion(message, job));
        }
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);

        let listener = CompletionListener::new(stream.clone(), sink.clone(), rx).with_batch_size(1);
        let handle = tokio::spawn(listener.run());

        for _ in 0..100 {
            if stream.acked.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*stream.acked.lock().await, vec!["1-0".to_string(), "2-0".to_string()]);
        assert_eq!(sink.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unacknowledged_completions_handled_before_new_ones() {
        let stream = Arc::new(FakeStream::default());
        stream.pending.lock().await.push(completion("9-0", "new"));
        for (message, job) in [("1-0", "left-1"), ("2-0", "left-2"), ("3-0", "left-3")] {
            stream.unacked.lock().await.push(completion(message, job));
        }
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);

        let listener = CompletionListener::new(stream.clone(), sink.clone(), rx).with_batch_size(2);
        let handle = tokio::spawn(listener.run());

        for _ in 0..100 {
            if stream.acked.lock().await.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*stream.acked.lock().await, vec!["1-0", "2-0", "3-0", "9-0"]);
        assert_eq!(
            *sink.seen.lock().await,
            vec![
                JobId::from("left-1"),
                JobId::from("left-2"),
                JobId::from("left-3"),
                JobId::from("new"),
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_repeats_on_interval() {
        let stream = Arc::new(FakeStream::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);

        let listener = CompletionListener::new(stream.clone(), sink.clone(), rx)
            .with_recover_interval(Duration::from_millis(20));
        let handle = tokio::spawn(listener.run());

        // Left unacknowledged by another listener after this one started.
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.unacked.lock().await.push(completion("5-0", "orphan"));

        for _ in 0..100 {
            if !stream.acked.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*stream.acked.lock().await, vec!["5-0"]);
    }
}
