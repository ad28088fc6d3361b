//! Shared test utilities for stream testing
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestNames`: unique stream, subject and durable names per test (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::{TestNames, TestNats};
//!
//! # async fn example() {
//! let nats = TestNats::new().await;
//! let names = TestNames::new("orders");
//!
//! let jetstream = nats.jetstream();
//! // create names.stream() bound to names.subject(), consume with names.durable()
//! # }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Unique names for the JetStream objects a test creates.
///
/// Tests that share a server must not share streams: a work-queue stream
/// only allows one consumer per subject filter.
#[derive(Clone, Debug)]
pub struct TestNames {
    prefix: String,
    id: String,
}

impl TestNames {
    pub fn new(prefix: &str) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            prefix: prefix.to_ascii_lowercase(),
            id: id[..12].to_string(),
        }
    }

    /// Stream names are upper case by convention.
    pub fn stream(&self) -> String {
        format!("{}_{}", self.prefix, self.id).to_ascii_uppercase()
    }

    pub fn subject(&self) -> String {
        format!("{}.{}.queue", self.prefix, self.id)
    }

    /// Wildcard covering every subject of this test.
    pub fn subject_filter(&self) -> String {
        format!("{}.{}.>", self.prefix, self.id)
    }

    pub fn durable(&self) -> String {
        format!("{}-{}-consumer", self.prefix, self.id)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that an operation finished within a deadline
    pub fn assert_within(elapsed: Duration, limit: Duration, context: &str) {
        assert!(
            elapsed < limit,
            "{}: took {:?}, expected less than {:?}",
            context,
            elapsed,
            limit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let first = TestNames::new("orders");
        let second = TestNames::new("orders");
        assert_ne!(first.stream(), second.stream());
        assert_ne!(first.durable(), second.durable());
    }

    #[test]
    fn test_names_shape() {
        let names = TestNames::new("Orders");
        assert!(names.stream().starts_with("ORDERS_"));
        assert!(names.subject().starts_with("orders."));
        assert!(names.subject().ends_with(".queue"));
        assert!(names.subject_filter().ends_with(".>"));
        assert!(names.durable().ends_with("-consumer"));
    }

    #[test]
    fn test_subject_is_inside_filter() {
        let names = TestNames::new("jobs");
        let filter = names.subject_filter();
        let base = filter.trim_end_matches('>');
        assert!(names.subject().starts_with(base));
    }
}
