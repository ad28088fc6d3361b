//! Consume loop that restarts its subscription on unrecoverable errors.

use std::time::Duration;

use reliable_stream::{
    CancellationToken, Connection, Envelope, ReliablePullSubscriber, StreamError,
    SubscriberConfig,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    /// Wait for the server to confirm each ack.
    pub ack_sync: bool,
    /// Stop after this many acked messages.
    pub max_messages: Option<u64>,
    /// Upper bound on any backoff sleep.
    pub max_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_timeout: Duration::from_secs(5),
            ack_sync: false,
            max_messages: None,
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub recoverable_errors: u64,
    pub restarts: u64,
}

enum Step {
    Continue,
    Restart,
    Finish,
}

pub struct Worker<C: Connection> {
    subscriber: ReliablePullSubscriber<C>,
    settings: WorkerSettings,
}

impl<C: Connection> Worker<C> {
    pub fn new(connection: C, subscriber: SubscriberConfig, settings: WorkerSettings) -> Self {
        Self {
            subscriber: ReliablePullSubscriber::new(connection, subscriber),
            settings,
        }
    }

    /// Consume until `cancel` fires or `max_messages` have been acked.
    #[instrument(skip_all, fields(subject = %self.subscriber.config().subject))]
    pub async fn run(&self, cancel: &CancellationToken) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut attempt = 0u32;

        'restart: while !cancel.is_cancelled() {
            if let Err(err) = self.subscriber.start().await {
                warn!(error = %err, "Failed to start subscriber");
                if !self.backoff(&err, attempt, cancel).await {
                    break;
                }
                attempt = attempt.saturating_add(1);
                continue;
            }
            info!("Consuming");

            loop {
                let result = self
                    .subscriber
                    .next_messages(self.settings.batch_size, self.settings.fetch_timeout, cancel)
                    .await;

                let err = match result {
                    Ok(messages) => {
                        attempt = 0;
                        match self.handle(messages, &mut report, cancel).await {
                            Step::Continue => continue,
                            Step::Restart => {
                                self.restart(&mut report).await;
                                continue 'restart;
                            }
                            Step::Finish => break 'restart,
                        }
                    }
                    Err(err) => err,
                };

                match err {
                    StreamError::Cancelled => break 'restart,
                    StreamError::Recoverable { .. } => {
                        report.recoverable_errors += 1;
                        warn!(error = %err, attempt, "Fetch failed, retrying");
                    }
                    StreamError::Unrecoverable { .. } => {
                        warn!(error = %err, "Fetch failed, restarting subscriber");
                        self.restart(&mut report).await;
                    }
                }

                if !self.backoff(&err, attempt, cancel).await {
                    break 'restart;
                }
                attempt = attempt.saturating_add(1);
                if err.is_unrecoverable() {
                    continue 'restart;
                }
            }
        }

        self.subscriber.stop().await;
        info!(
            processed = report.processed,
            restarts = report.restarts,
            "Worker stopped"
        );
        report
    }

    async fn handle(
        &self,
        messages: Vec<Envelope>,
        report: &mut WorkerReport,
        cancel: &CancellationToken,
    ) -> Step {
        for message in messages {
            debug!(dump = %message.dump(), "Received message");

            let acked = if self.settings.ack_sync {
                message.ack_sync(self.settings.fetch_timeout, cancel).await
            } else {
                message.ack(cancel).await
            };

            match acked {
                Ok(()) => report.processed += 1,
                // Redelivered after the ack wait.
                Err(StreamError::Recoverable { .. }) => {
                    report.recoverable_errors += 1;
                    warn!(sequence = message.sequence(), "Ack failed, message will be redelivered");
                }
                Err(StreamError::Unrecoverable { message: reason, .. }) => {
                    warn!(sequence = message.sequence(), %reason, "Ack failed, restarting subscriber");
                    return Step::Restart;
                }
                Err(StreamError::Cancelled) => return Step::Finish,
            }

            if self
                .settings
                .max_messages
                .is_some_and(|max| report.processed >= max)
            {
                return Step::Finish;
            }
        }
        Step::Continue
    }

    async fn restart(&self, report: &mut WorkerReport) {
        self.subscriber.stop().await;
        report.restarts += 1;
    }

    /// Sleep for the suggested delay. Returns false when cancelled first.
    async fn backoff(&self, err: &StreamError, attempt: u32, cancel: &CancellationToken) -> bool {
        let Some(delay) = err.retry_delay(attempt) else {
            return false;
        };
        let delay = delay.min(self.settings.max_backoff);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
