//! Errors raised while setting up the NATS backend.
//!
//! Faults from a live connection are reported as `reliable_stream::BrokerFault`
//! and classified by `reliable_stream`; `NatsError` covers connecting and
//! provisioning, which happen before any classification applies.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatsError {
    /// Could not establish the initial connection
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// JetStream API rejected a request
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Stream lookup failed
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),
}

impl NatsError {
    pub fn from_jetstream_error(error: impl fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = NatsError::from_jetstream_error("stream name already in use");
        assert_eq!(err.to_string(), "JetStream error: stream name already in use");

        let err = NatsError::StreamNotFound("ORDERS".into());
        assert_eq!(err.to_string(), "Stream not found: ORDERS");
    }

    #[test]
    fn test_config_error_converts() {
        let err: NatsError = core_config::ConfigError::MissingEnvVar("NATS_URL".into()).into();
        assert!(err.to_string().contains("NATS_URL"));
    }
}
