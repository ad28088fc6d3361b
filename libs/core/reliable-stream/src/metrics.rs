//! Metrics for publishers and subscribers.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, describe_counter};

use crate::error::FaultKind;

/// Register descriptions for every counter this crate records.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "reliable_stream_fetch_total",
        "Fetches by subscriber and outcome (messages, empty, recoverable, unrecoverable, cancelled)"
    );
    describe_counter!(
        "reliable_stream_messages_received_total",
        "Messages handed out by subscribers"
    );
    describe_counter!(
        "reliable_stream_publish_total",
        "Publishes by publisher and outcome"
    );
    describe_counter!(
        "reliable_stream_health_transitions_total",
        "Connection health changes seen by subscribers"
    );
}

#[derive(Debug, Clone)]
pub(crate) struct StreamMetrics {
    name: String,
}

impl StreamMetrics {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Record a fetch that returned `count` messages (zero for an empty poll).
    pub(crate) fn fetch_completed(&self, count: usize) {
        let outcome = if count == 0 { "empty" } else { "messages" };
        counter!(
            "reliable_stream_fetch_total",
            "name" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);

        if count > 0 {
            counter!(
                "reliable_stream_messages_received_total",
                "name" => self.name.clone()
            )
            .increment(count as u64);
        }
    }

    pub(crate) fn fetch_failed(&self, kind: FaultKind) {
        counter!(
            "reliable_stream_fetch_total",
            "name" => self.name.clone(),
            "outcome" => kind.to_string()
        )
        .increment(1);
    }

    pub(crate) fn publish_succeeded(&self) {
        counter!(
            "reliable_stream_publish_total",
            "name" => self.name.clone(),
            "outcome" => "ok"
        )
        .increment(1);
    }

    pub(crate) fn publish_failed(&self, kind: FaultKind) {
        counter!(
            "reliable_stream_publish_total",
            "name" => self.name.clone(),
            "outcome" => kind.to_string()
        )
        .increment(1);
    }

    pub(crate) fn health_changed(&self, healthy: bool) {
        counter!(
            "reliable_stream_health_transitions_total",
            "name" => self.name.clone(),
            "state" => if healthy { "healthy" } else { "unhealthy" }
        )
        .increment(1);
    }
}
