//! Contracts a broker client must satisfy.
//!
//! The core never talks to a wire protocol directly. A backend (the NATS
//! JetStream one, or [`crate::memory`] in tests) implements these traits and
//! reports failures as [`BrokerFault`]s, which the publisher and subscriber
//! classify.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerFault;

/// Connection lifecycle event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected or reconnected
    Connected,
    Disconnected,
    /// Server is draining connections before shutdown
    LameDuck,
    /// Client is draining before close
    Draining,
    Closed,
    SlowConsumer,
    ServerError(String),
    ClientError(String),
}

impl ConnectionEvent {
    /// Whether this event means the connection can no longer serve requests.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Disconnected
                | ConnectionEvent::LameDuck
                | ConnectionEvent::Draining
                | ConnectionEvent::Closed
        )
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected => write!(f, "connected"),
            ConnectionEvent::Disconnected => write!(f, "disconnected"),
            ConnectionEvent::LameDuck => write!(f, "lame duck mode"),
            ConnectionEvent::Draining => write!(f, "draining"),
            ConnectionEvent::Closed => write!(f, "closed"),
            ConnectionEvent::SlowConsumer => write!(f, "slow consumer"),
            ConnectionEvent::ServerError(err) => write!(f, "server error: {err}"),
            ConnectionEvent::ClientError(err) => write!(f, "client error: {err}"),
        }
    }
}

/// Receives connection events on the connection's own callback task.
///
/// Implementations must not block.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Registration handle returned by [`Connection::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Ordered, multi-valued message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value; existing values for `name` are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Number of values (not distinct names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Server acknowledgement of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Acknowledges one received message.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Fire-and-forget acknowledgement.
    async fn ack(&self) -> Result<(), BrokerFault>;

    /// Acknowledge and wait for the server to confirm, up to `timeout`.
    async fn ack_sync(&self, timeout: Duration) -> Result<(), BrokerFault>;
}

/// Message as handed over by a backend fetch.
pub struct RawMessage {
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub sequence: u64,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("headers", &self.headers.len())
            .field("payload", &self.payload.len())
            .finish()
    }
}

/// Publish side of a connection.
#[async_trait]
pub trait PublishContext: Send + Sync + 'static {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, BrokerFault>;
}

/// Pull subscription bound to one subject and durable consumer.
#[async_trait]
pub trait PullSubscription: Send + Sync + 'static {
    /// Fetch up to `batch_size` messages.
    ///
    /// Waits at most `timeout` for the first message, then returns whatever is
    /// already available without waiting for the rest of the batch. When
    /// `interrupt` fires the call returns the messages received so far,
    /// possibly none.
    async fn fetch(
        &self,
        batch_size: usize,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<Vec<RawMessage>, BrokerFault>;

    async fn unsubscribe(&self) -> Result<(), BrokerFault>;
}

/// Long-lived connection owned by the caller and shared by publishers and subscribers.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    type Publisher: PublishContext;
    type Subscription: PullSubscription;

    fn is_connected(&self) -> bool;

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    async fn publish_context(&self) -> Result<Self::Publisher, BrokerFault>;

    async fn pull_subscription(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Self::Subscription, BrokerFault>;

    async fn close(&self) -> Result<(), BrokerFault>;
}
