//! JetStream publish context.

use async_nats::jetstream::context::{PublishError, PublishErrorKind};
use async_nats::jetstream::Context;
use async_nats::HeaderMap;
use async_trait::async_trait;
use reliable_stream::{BrokerFault, Headers, OutboundMessage, PublishAck, PublishContext};
use tracing::debug;

use crate::connection::Link;

/// Publishes to JetStream and waits for the stream's acknowledgement.
pub struct NatsPublisher {
    jetstream: Context,
    link: Link,
}

impl NatsPublisher {
    pub(crate) fn new(jetstream: Context, link: Link) -> Self {
        Self { jetstream, link }
    }
}

#[async_trait]
impl PublishContext for NatsPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, BrokerFault> {
        self.link.check()?;

        let OutboundMessage {
            subject,
            headers,
            payload,
        } = message;

        let pending = if headers.is_empty() {
            self.jetstream.publish(subject.clone(), payload).await
        } else {
            self.jetstream
                .publish_with_headers(subject.clone(), to_header_map(&headers), payload)
                .await
        }
        .map_err(|e| publish_fault(&self.link, e))?;

        let ack = pending.await.map_err(|e| publish_fault(&self.link, e))?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Published to JetStream"
        );

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }
}

fn publish_fault(link: &Link, error: PublishError) -> BrokerFault {
    match error.kind() {
        PublishErrorKind::TimedOut => BrokerFault::TimedOut(error.to_string()),
        // No stream captures the subject; the stream may be recreated.
        PublishErrorKind::StreamNotFound => BrokerFault::Protocol(error.to_string()),
        PublishErrorKind::BrokenPipe => link.fault(BrokerFault::Io, error),
        _ => link.fault(BrokerFault::Protocol, error),
    }
}

pub(crate) fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        map.append(name, value);
    }
    map
}

