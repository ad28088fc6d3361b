//! NATS test infrastructure
//!
//! `TestNats` runs a NATS server with JetStream in a container.

use async_nats::Client;
use async_nats::jetstream::{self, stream};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

use crate::TestNames;

// Re-export for test convenience
#[allow(unused_imports)]
pub use futures::StreamExt;

/// NATS container with JetStream enabled.
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::{TestNames, TestNats};
///
/// # async fn example() {
/// let nats = TestNats::new().await;
/// let names = TestNames::new("orders");
/// nats.create_work_queue_stream(&names).await;
///
/// let url = nats.connection_string();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Side-channel client, independent of the connection under test
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Create the work-queue stream named by `names`, bound to its subject filter.
    pub async fn create_work_queue_stream(&self, names: &TestNames) -> stream::Stream {
        self.jetstream()
            .create_stream(stream::Config {
                name: names.stream(),
                subjects: vec![names.subject_filter()],
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .expect("Failed to create work-queue stream")
    }

    /// Number of messages currently stored in a stream.
    pub async fn stream_messages(&self, stream_name: &str) -> u64 {
        let mut stream = self
            .jetstream()
            .get_stream(stream_name)
            .await
            .expect("Failed to get stream");
        stream
            .info()
            .await
            .expect("Failed to get stream info")
            .state
            .messages
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_work_queue_stream_accepts_publishes() {
        let nats = TestNats::new().await;
        let names = TestNames::new("setup");
        nats.create_work_queue_stream(&names).await;

        let ack = nats
            .jetstream()
            .publish(names.subject(), "hello".into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get ack");

        assert_eq!(ack.stream, names.stream());
        assert_eq!(nats.stream_messages(&names.stream()).await, 1);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_acked_messages_leave_work_queue() {
        let nats = TestNats::new().await;
        let names = TestNames::new("drain");
        let stream = nats.create_work_queue_stream(&names).await;

        for i in 0..3 {
            nats.jetstream()
                .publish(names.subject(), format!("message-{}", i).into())
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                durable_name: Some(names.durable()),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .expect("Failed to create consumer");

        let mut messages = consumer.fetch().max_messages(10).messages().await.unwrap();
        let mut count = 0;
        while let Some(Ok(msg)) = messages.next().await {
            msg.double_ack().await.expect("Failed to ack");
            count += 1;
        }

        assert_eq!(count, 3);
        assert_eq!(nats.stream_messages(&names.stream()).await, 0);
    }
}
