//! Reliable publishing and pull consumption over durable work-queue streams.
//!
//! Broker clients tend to block through cancellation, report every failure as
//! the same generic error, and give callers no way to tell "retry this call"
//! from "rebuild the subscription first". This crate wraps a broker
//! [`Connection`] with:
//!
//! - **[`ReliablePullSubscriber`]**: start/stop lifecycle, one fetch at a time,
//!   health-aware fetches that return promptly when the connection drops
//! - **[`ReliablePublisher`]**: start guarding and fault classification
//! - **[`StreamError`]**: every failure is `Recoverable`, `Unrecoverable` or `Cancelled`
//!
//! # Worker loop
//!
//! ```ignore
//! use reliable_stream::{ReliablePullSubscriber, StreamError, SubscriberConfig};
//!
//! let subscriber = ReliablePullSubscriber::new(connection, SubscriberConfig::new(subject, durable));
//!
//! 'restart: loop {
//!     if let Err(err) = subscriber.start().await {
//!         // unrecoverable: back off and try again
//!         tokio::time::sleep(err.retry_delay(0).unwrap_or_default()).await;
//!         continue;
//!     }
//!     loop {
//!         match subscriber.next_message(Duration::from_secs(60), &cancel).await {
//!             Ok(Some(message)) => message.ack(&cancel).await?,
//!             Ok(None) => continue,
//!             Err(StreamError::Recoverable { .. }) => tokio::time::sleep(backoff).await,
//!             Err(StreamError::Unrecoverable { .. }) => {
//!                 subscriber.stop().await;
//!                 continue 'restart;
//!             }
//!             Err(StreamError::Cancelled) => break 'restart,
//!         }
//!     }
//! }
//! ```
//!
//! # Backends
//!
//! The [`broker`] traits are implemented for NATS JetStream by the
//! `reliable_stream_nats` crate, and in process by [`memory::MemoryBroker`].

pub mod broker;
mod compat;
mod config;
mod envelope;
mod error;
mod health;
pub mod memory;
mod metrics;
mod publisher;
mod subscriber;

pub use broker::{
    Acknowledger, Connection, ConnectionEvent, ConnectionListener, Headers, ListenerId,
    OutboundMessage, PublishAck, PublishContext, PullSubscription, RawMessage,
};
pub use config::{
    PublisherConfig, SubscriberConfig, DEFAULT_FETCH_GRACE, DEFAULT_PUBLISH_TIMEOUT,
};
pub use envelope::{Envelope, DEFAULT_DUMP_LIMIT};
pub use error::{BrokerFault, FaultKind, StreamError};
pub use health::HealthState;
pub use self::metrics::describe_metrics;
pub use publisher::ReliablePublisher;
pub use subscriber::ReliablePullSubscriber;

// Re-export so callers don't need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
