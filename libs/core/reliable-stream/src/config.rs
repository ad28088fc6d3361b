//! Publisher and subscriber configuration.

use std::time::Duration;

/// Extra time a fetch may take beyond its requested timeout before the
/// watchdog gives up on the backend.
pub const DEFAULT_FETCH_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on one publish round-trip.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`crate::ReliablePullSubscriber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Subject the durable consumer filters on
    pub subject: String,

    /// Durable consumer name
    pub durable_name: String,

    pub fetch_grace: Duration,
}

impl SubscriberConfig {
    pub fn new(subject: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            durable_name: durable_name.into(),
            fetch_grace: DEFAULT_FETCH_GRACE,
        }
    }

    /// Set the watchdog grace period.
    pub fn with_fetch_grace(mut self, grace: Duration) -> Self {
        self.fetch_grace = grace;
        self
    }
}

/// Configuration for a [`crate::ReliablePublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Name used in logs and metrics
    pub name: String,

    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "publisher".to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl PublisherConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}
