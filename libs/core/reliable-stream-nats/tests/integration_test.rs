//! Integration tests against a real NATS server.
//!
//! Each test starts its own JetStream container, so they need docker:
//! `cargo test -p reliable_stream_nats -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use reliable_stream::{
    CancellationToken, Connection, OutboundMessage, ReliablePublisher, ReliablePullSubscriber,
    SubscriberConfig,
};
use reliable_stream_nats::{ConnectionProvider, NatsConfig, NatsConnection};
use test_utils::assertions::assert_within;
use test_utils::{TestNames, TestNats};
use tokio::time::Instant;

async fn connect(nats: &TestNats) -> NatsConnection {
    let config = NatsConfig::new(nats.connection_string()).with_connection_name("integration");
    NatsConnection::connect(&config)
        .await
        .expect("Failed to connect to NATS")
}

async fn subscriber_for(
    connection: &NatsConnection,
    names: &TestNames,
) -> Arc<ReliablePullSubscriber<NatsConnection>> {
    let subscriber = Arc::new(ReliablePullSubscriber::new(
        connection.clone(),
        SubscriberConfig::new(names.subject(), names.durable()),
    ));
    subscriber.start().await.expect("Failed to start subscriber");
    subscriber
}

async fn publisher_for(connection: &NatsConnection) -> ReliablePublisher<NatsConnection> {
    let publisher = ReliablePublisher::new(connection.clone());
    publisher.start().await.expect("Failed to start publisher");
    publisher
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_publish_consume_and_ack() {
        let nats = TestNats::new().await;
        let names = TestNames::new("delivery");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let publisher = publisher_for(&connection).await;
        let subscriber = subscriber_for(&connection, &names).await;
        let cancel = CancellationToken::new();

        let ack = publisher
            .publish(
                OutboundMessage::new(names.subject(), "Hello 1").with_header("trace-id", "t-1"),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(ack.stream, names.stream());
        assert_eq!(ack.sequence, 1);

        let message = subscriber
            .next_message(Duration::from_secs(5), &cancel)
            .await
            .unwrap()
            .expect("message should be delivered");
        assert_eq!(message.subject(), names.subject());
        assert_eq!(message.payload().as_ref(), b"Hello 1");
        assert_eq!(message.headers().get("trace-id"), Some("t-1"));
        assert_eq!(message.sequence(), 1);
        assert!(message.dump().contains("data: bytes=7"));

        message
            .ack_sync(Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(nats.stream_messages(&names.stream()).await, 0);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_partial_batch_returns_before_timeout() {
        let nats = TestNats::new().await;
        let names = TestNames::new("partial");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let publisher = publisher_for(&connection).await;
        let subscriber = subscriber_for(&connection, &names).await;
        let cancel = CancellationToken::new();

        for i in 0..3 {
            publisher
                .publish(OutboundMessage::new(names.subject(), format!("m-{i}")), &cancel)
                .await
                .unwrap();
        }

        let started = Instant::now();
        let messages = subscriber
            .next_messages(100, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
        assert_within(started.elapsed(), Duration::from_secs(5), "partial batch");

        let payloads: Vec<_> = messages
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).to_string())
            .collect();
        assert_eq!(payloads, vec!["m-0", "m-1", "m-2"]);
        for message in &messages {
            message.ack(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_empty_queue_returns_none_after_timeout() {
        let nats = TestNats::new().await;
        let names = TestNames::new("empty");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let subscriber = subscriber_for(&connection, &names).await;

        let started = Instant::now();
        let message = subscriber
            .next_message(Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();
        assert!(message.is_none());
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_cancel_interrupts_long_fetch() {
        let nats = TestNats::new().await;
        let names = TestNames::new("cancel");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let subscriber = subscriber_for(&connection, &names).await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = subscriber
            .next_message(Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_within(started.elapsed(), Duration::from_secs(3), "cancelled fetch");

        // The subscription is still usable after a cancelled fetch.
        let message = subscriber
            .next_message(Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();
        assert!(message.is_none());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_start_without_stream_is_unrecoverable() {
        let nats = TestNats::new().await;
        let names = TestNames::new("missing");

        let connection = connect(&nats).await;
        let subscriber = ReliablePullSubscriber::new(
            connection.clone(),
            SubscriberConfig::new(names.subject(), names.durable()),
        );

        let err = subscriber.start().await.unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(!subscriber.is_active());
        assert_eq!(connection.listener_count(), 0);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_deleted_stream_requires_restart() {
        let nats = TestNats::new().await;
        let names = TestNames::new("deleted");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let subscriber = subscriber_for(&connection, &names).await;

        assert!(connection.admin().delete_stream(&names.stream()).await.unwrap());

        let result = subscriber
            .next_message(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(!matches!(result, Ok(Some(_))));

        subscriber.stop().await;
        let err = subscriber.start().await.unwrap_err();
        assert!(err.is_unrecoverable());

        nats.create_work_queue_stream(&names).await;
        subscriber.start().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_closed_connection_rejects_publish() {
        let nats = TestNats::new().await;
        let names = TestNames::new("closed");
        nats.create_work_queue_stream(&names).await;

        let connection = connect(&nats).await;
        let publisher = publisher_for(&connection).await;
        let subscriber = subscriber_for(&connection, &names).await;
        assert!(subscriber.is_healthy());

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
        assert!(!subscriber.is_healthy());

        let err = publisher
            .publish(
                OutboundMessage::new(names.subject(), "late"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());

        let err = subscriber
            .next_message(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}

mod provisioning_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_create_list_and_delete_streams() {
        let nats = TestNats::new().await;
        let connection = connect(&nats).await;
        let admin = connection.admin();

        let first = TestNames::new("first");
        let second = TestNames::new("second");
        let subject = first.subject_filter();
        let info = admin
            .create_work_queue_stream(&first.stream(), &[subject.as_str()])
            .await
            .unwrap();
        assert_eq!(info.config.name, first.stream());

        let subject = second.subject_filter();
        admin
            .create_work_queue_stream(&second.stream(), &[subject.as_str()])
            .await
            .unwrap();
        admin
            .create_durable_consumer(&second.stream(), &second.durable(), &second.subject())
            .await
            .unwrap();

        let mut names = admin.stream_names().await.unwrap();
        names.sort();
        let mut expected = vec![first.stream(), second.stream()];
        expected.sort();
        assert_eq!(names, expected);

        let deleted = admin.delete_all_streams().await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(admin.stream_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_provider_shares_one_connection() {
        let nats = TestNats::new().await;
        let provider = ConnectionProvider::new(NatsConfig::new(nats.connection_string()));
        assert!(provider.current().is_none());

        let first = provider.get().await.unwrap();
        let second = provider.get().await.unwrap();

        let names = TestNames::new("shared");
        nats.create_work_queue_stream(&names).await;
        let _subscriber = subscriber_for(&first, &names).await;

        assert_eq!(first.listener_count(), 1);
        assert_eq!(second.listener_count(), 1);
    }
}
