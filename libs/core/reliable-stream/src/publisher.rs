//! Publisher with start/stop guarding and fault classification.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::broker::{Connection, OutboundMessage, PublishAck, PublishContext};
use crate::compat::{self, Absorbed};
use crate::config::PublisherConfig;
use crate::error::{BrokerFault, StreamError};
use crate::metrics::StreamMetrics;

/// Publishes messages to a durable stream.
///
/// ```ignore
/// let publisher = ReliablePublisher::new(connection);
/// publisher.start().await?;
///
/// let ack = publisher
///     .publish(OutboundMessage::new("request.queue.priority", "Hello 1"), &cancel)
///     .await?;
/// ```
pub struct ReliablePublisher<C: Connection> {
    connection: C,
    config: PublisherConfig,
    context: ArcSwapOption<C::Publisher>,
    metrics: StreamMetrics,
}

impl<C: Connection> ReliablePublisher<C> {
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, PublisherConfig::default())
    }

    pub fn with_config(connection: C, config: PublisherConfig) -> Self {
        let metrics = StreamMetrics::new(&config.name);
        Self {
            connection,
            config,
            context: ArcSwapOption::empty(),
            metrics,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.context.load().is_some()
    }

    /// Acquire a publish context from the connection.
    #[instrument(skip(self), fields(publisher = %self.config.name))]
    pub async fn start(&self) -> Result<&Self, StreamError> {
        if self.is_started() {
            return Err(StreamError::unrecoverable("publisher already active"));
        }

        let context = self.connection.publish_context().await.map_err(|fault| {
            StreamError::unrecoverable_with_source("failed to create publish context", fault)
        })?;

        let lost_race = self
            .context
            .compare_and_swap(&None::<Arc<C::Publisher>>, Some(Arc::new(context)))
            .is_some();
        if lost_race {
            return Err(StreamError::unrecoverable("publisher already active"));
        }

        info!("Publisher started");
        Ok(self)
    }

    /// Drop the publish context. Safe to call in any state.
    pub fn stop(&self) {
        if self.context.swap(None).is_some() {
            info!(publisher = %self.config.name, "Publisher stopped");
        }
    }

    /// Publish one message and wait for the stream's acknowledgement.
    ///
    /// A cancelled token fails fast without touching the network; a publish
    /// already in flight is not abandoned.
    #[instrument(skip(self, message, cancel), fields(publisher = %self.config.name, subject = %message.subject))]
    pub async fn publish(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<PublishAck, StreamError> {
        let result = self.try_publish(message, cancel).await;
        match &result {
            Ok(_) => self.metrics.publish_succeeded(),
            Err(err) => self.metrics.publish_failed(err.kind()),
        }
        result
    }

    async fn try_publish(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<PublishAck, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let Some(context) = self.context.load_full() else {
            return Err(StreamError::unrecoverable(
                "publisher not started (start() must be called first)",
            ));
        };

        let subject = message.subject.clone();
        let timeout = self.config.publish_timeout;
        let outcome = tokio::time::timeout(timeout, context.publish(message)).await;

        match outcome {
            Ok(Ok(ack)) => {
                debug!(stream = %ack.stream, sequence = ack.sequence, "Message published");
                Ok(ack)
            }
            Ok(Err(fault)) => match compat::absorb(fault, cancel) {
                Absorbed::Cancelled => Err(StreamError::Cancelled),
                // The publish may or may not have been stored.
                Absorbed::Swallowed(fault) => Err(StreamError::unrecoverable_with_source(
                    format!("publish to {subject} may not have completed"),
                    fault,
                )),
                Absorbed::Unhandled(fault) => Err(StreamError::from_fault(
                    format!("failed to publish to {subject}"),
                    fault,
                )),
            },
            Err(_) => Err(StreamError::recoverable_with_source(
                format!("publish to {subject} was not acknowledged"),
                BrokerFault::TimedOut(format!("no ack within {timeout:?}")),
            )),
        }
    }
}

impl<C: Connection> std::fmt::Debug for ReliablePublisher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliablePublisher")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::time::Duration;

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .create_work_queue_stream("ORDERS", ["orders.>"])
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_start_twice_is_unrecoverable() {
        let publisher = ReliablePublisher::new(broker());
        publisher.start().await.unwrap();
        assert!(publisher.is_started());

        let err = publisher.start().await.unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(err.message().contains("already active"));
    }

    #[tokio::test]
    async fn test_stop_then_start_again() {
        let publisher = ReliablePublisher::new(broker());
        publisher.stop();
        publisher.start().await.unwrap();
        publisher.stop();
        publisher.stop();
        assert!(!publisher.is_started());
        publisher.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_before_start_is_unrecoverable() {
        let broker = broker();
        let publisher = ReliablePublisher::new(broker.clone());

        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
        assert_eq!(broker.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let publisher = ReliablePublisher::new(broker());
        publisher.start().await.unwrap();
        let cancel = CancellationToken::new();

        for expected in 1..=3 {
            let ack = publisher
                .publish(OutboundMessage::new("orders.new", format!("Hello {expected}")), &cancel)
                .await
                .unwrap();
            assert_eq!(ack.stream, "ORDERS");
            assert_eq!(ack.sequence, expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_publish_never_reaches_broker() {
        let broker = broker();
        let publisher = ReliablePublisher::new(broker.clone());
        publisher.start().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(broker.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_recoverable() {
        let broker = broker();
        let publisher = ReliablePublisher::new(broker.clone());
        publisher.start().await.unwrap();

        broker.disconnect();
        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        broker.reconnect();
        publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_close_is_unrecoverable() {
        let broker = broker();
        let publisher = ReliablePublisher::new(broker.clone());
        publisher.start().await.unwrap();

        broker.close().await.unwrap();
        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn test_start_on_closed_connection_is_unrecoverable() {
        let broker = broker();
        broker.close().await.unwrap();

        let publisher = ReliablePublisher::new(broker);
        assert!(publisher.start().await.unwrap_err().is_unrecoverable());
        assert!(!publisher.is_started());
    }

    #[tokio::test]
    async fn test_spurious_lock_release_never_reports_success() {
        let broker = broker();
        let publisher = ReliablePublisher::new(broker.clone());
        publisher.start().await.unwrap();

        broker.inject_publish_fault(BrokerFault::SpuriousLockRelease("unlock".into()));
        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(matches!(err.fault(), Some(BrokerFault::SpuriousLockRelease(_))));
    }

    #[tokio::test]
    async fn test_publish_without_ack_times_out_as_recoverable() {
        let broker = broker();
        let publisher = ReliablePublisher::with_config(
            broker.clone(),
            PublisherConfig::new("slow").with_publish_timeout(Duration::from_millis(50)),
        );
        publisher.start().await.unwrap();

        broker.set_publish_delay(Duration::from_millis(500));
        let err = publisher
            .publish(OutboundMessage::new("orders.new", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err.fault(), Some(BrokerFault::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_publish_without_matching_stream_is_recoverable() {
        let publisher = ReliablePublisher::new(broker());
        publisher.start().await.unwrap();

        let err = publisher
            .publish(OutboundMessage::new("unrouted.subject", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
