//! Pull subscription over a durable JetStream consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::consumer::pull::{Batch, Config as ConsumerConfig};
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer};
use async_nats::jetstream::{self, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use reliable_stream::{Acknowledger, BrokerFault, Headers, PullSubscription, RawMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Link;

/// Pull subscription bound to a durable consumer with explicit acks.
pub struct NatsSubscription {
    consumer: PullConsumer,
    link: Link,
    subject: String,
    durable_name: String,
    unsubscribed: AtomicBool,
}

impl NatsSubscription {
    /// Bind to the stream that captures `subject`, creating the durable
    /// consumer on first use.
    pub(crate) async fn bind(
        jetstream: &Context,
        link: Link,
        subject: &str,
        durable_name: &str,
    ) -> Result<Self, BrokerFault> {
        let stream_name = jetstream
            .stream_by_subject(subject)
            .await
            .map_err(|e| link.fault(BrokerFault::NotFound, format!("no stream for {subject}: {e}")))?;

        let stream = jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| link.fault(BrokerFault::NotFound, e))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                ConsumerConfig {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| link.fault(BrokerFault::IllegalState, e))?;

        info!(
            stream = %stream_name,
            subject = %subject,
            consumer = %durable_name,
            "Bound pull subscription"
        );

        Ok(Self {
            consumer,
            link,
            subject: subject.to_string(),
            durable_name: durable_name.to_string(),
            unsubscribed: AtomicBool::new(false),
        })
    }

    /// Issue a pull request, abandoning it if `interrupt` fires first.
    async fn request(
        &self,
        max_messages: usize,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<Option<Batch>, BrokerFault> {
        let pending = async {
            match timeout {
                Some(expires) => {
                    self.consumer
                        .batch()
                        .max_messages(max_messages)
                        .expires(expires)
                        .messages()
                        .await
                }
                None => {
                    self.consumer
                        .fetch()
                        .max_messages(max_messages)
                        .messages()
                        .await
                }
            }
        };

        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Ok(None),
            batch = pending => batch
                .map(Some)
                .map_err(|e| self.link.fault(BrokerFault::IllegalState, e)),
        }
    }

    /// Collect from `batch` until it ends or `interrupt` fires.
    async fn collect(
        &self,
        mut batch: Batch,
        into: &mut Vec<RawMessage>,
        interrupt: &CancellationToken,
    ) -> Result<(), BrokerFault> {
        loop {
            let item = tokio::select! {
                biased;
                _ = interrupt.cancelled() => return Ok(()),
                item = batch.next() => item,
            };
            match item {
                Some(Ok(message)) => into.push(self.to_raw(message)?),
                Some(Err(e)) => return Err(self.link.fault(BrokerFault::IllegalState, e)),
                None => return Ok(()),
            }
        }
    }

    fn to_raw(&self, message: jetstream::Message) -> Result<RawMessage, BrokerFault> {
        let sequence = message
            .info()
            .map_err(|e| BrokerFault::Protocol(format!("invalid reply subject: {e}")))?
            .stream_sequence;

        Ok(RawMessage {
            subject: message.subject.to_string(),
            headers: message
                .headers
                .as_ref()
                .map(from_header_map)
                .unwrap_or_default(),
            payload: message.payload.clone(),
            sequence,
            acker: Box::new(NatsAcker {
                message,
                link: self.link.clone(),
            }),
        })
    }
}

#[async_trait]
impl PullSubscription for NatsSubscription {
    /// Waits up to `timeout` for the first message, then drains whatever
    /// else is immediately available up to `batch_size`.
    async fn fetch(
        &self,
        batch_size: usize,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<Vec<RawMessage>, BrokerFault> {
        if self.unsubscribed.load(Ordering::SeqCst) {
            return Err(BrokerFault::IllegalState(format!(
                "subscription {} unsubscribed",
                self.durable_name
            )));
        }
        self.link.check()?;

        let mut messages = Vec::new();
        if batch_size == 0 {
            return Ok(messages);
        }

        // A zero expiry would make the server hold the request indefinitely.
        let expires = (!timeout.is_zero()).then_some(timeout);
        let Some(first) = self.request(1, expires, interrupt).await? else {
            return Ok(messages);
        };
        self.collect(first, &mut messages, interrupt).await?;

        if messages.is_empty() || batch_size == 1 || interrupt.is_cancelled() {
            return Ok(messages);
        }

        let remaining = batch_size - messages.len();
        let rest = match self.request(remaining, None, interrupt).await {
            Ok(Some(batch)) => self.collect(batch, &mut messages, interrupt).await,
            Ok(None) => Ok(()),
            Err(fault) => Err(fault),
        };
        if let Err(fault) = rest {
            // The first message is already delivered to us; hand it out.
            warn!(
                subject = %self.subject,
                consumer = %self.durable_name,
                received = messages.len(),
                error = %fault,
                "Fetch failed after messages arrived"
            );
        }

        Ok(messages)
    }

    async fn unsubscribe(&self) -> Result<(), BrokerFault> {
        // Pull consumers hold no client-side interest between requests.
        if !self.unsubscribed.swap(true, Ordering::SeqCst) {
            debug!(
                subject = %self.subject,
                consumer = %self.durable_name,
                "Pull subscription released"
            );
        }
        Ok(())
    }
}

/// Acks one JetStream message.
struct NatsAcker {
    message: jetstream::Message,
    link: Link,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> Result<(), BrokerFault> {
        self.link.check()?;
        self.message
            .ack()
            .await
            .map_err(|e| self.link.fault(BrokerFault::Io, e))
    }

    async fn ack_sync(&self, timeout: Duration) -> Result<(), BrokerFault> {
        self.link.check()?;
        match tokio::time::timeout(timeout, self.message.double_ack()).await {
            Ok(result) => result.map_err(|e| self.link.fault(BrokerFault::Io, e)),
            Err(_) => Err(BrokerFault::TimedOut(format!(
                "ack not confirmed within {timeout:?}"
            ))),
        }
    }
}

pub(crate) fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, values) in map.iter() {
        for value in values {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::to_header_map;

    #[test]
    fn test_headers_survive_header_map() {
        let headers: Headers = [("trace-id", "abc"), ("tag", "a"), ("tag", "b")]
            .into_iter()
            .collect();

        let converted = from_header_map(&to_header_map(&headers));

        assert_eq!(converted.len(), 3);
        assert_eq!(converted.get("trace-id"), Some("abc"));
        assert_eq!(converted.get_all("tag").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_header_map() {
        assert!(from_header_map(&HeaderMap::new()).is_empty());
    }
}
