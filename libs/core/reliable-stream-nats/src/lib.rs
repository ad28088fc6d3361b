//! NATS JetStream backend for `reliable_stream`.
//!
//! [`NatsConnection`] implements [`reliable_stream::Connection`]: connection
//! events from the client's event callback are fanned out to registered
//! listeners, publishes wait for the JetStream ack, and fetches pull from a
//! durable consumer with explicit acks.
//!
//! ```ignore
//! use core_config::NatsConfig;
//! use reliable_stream::{ReliablePullSubscriber, SubscriberConfig};
//! use reliable_stream_nats::NatsConnection;
//!
//! let connection = NatsConnection::connect(&NatsConfig::default()).await?;
//! connection
//!     .admin()
//!     .create_work_queue_stream("REQUESTS", &["request.queue.>"])
//!     .await?;
//!
//! let subscriber = ReliablePullSubscriber::new(
//!     connection.clone(),
//!     SubscriberConfig::new("request.queue.priority", "request-queue-consumer"),
//! );
//! subscriber.start().await?;
//! ```

mod admin;
mod connection;
mod consumer;
mod error;
mod producer;
mod provider;

pub use admin::StreamAdmin;
pub use connection::NatsConnection;
pub use consumer::NatsSubscription;
pub use error::NatsError;
pub use producer::NatsPublisher;
pub use provider::ConnectionProvider;

pub use core_config::NatsConfig;
