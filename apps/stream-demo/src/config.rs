//! Configuration for the demo CLI

use core_config::{env_or_default, ConfigError, FromEnv, NatsConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub nats: NatsConfig,

    /// Work-queue stream name
    pub stream: String,

    /// Subject the demo publishes to and consumes from
    pub subject: String,

    /// Durable consumer name
    pub durable: String,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            nats: NatsConfig::from_env()?,
            stream: env_or_default("STREAM_NAME", "REQUESTS"),
            subject: env_or_default("STREAM_SUBJECT", "request.queue.priority"),
            durable: env_or_default("STREAM_DURABLE", "request-queue-consumer"),
        })
    }
}

impl Config {
    /// Wildcard the stream binds, covering `subject` and its siblings.
    pub fn stream_subjects(&self) -> String {
        match self.subject.rsplit_once('.') {
            Some((prefix, _)) => format!("{prefix}.>"),
            None => self.subject.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        temp_env::with_vars_unset(["STREAM_NAME", "STREAM_SUBJECT", "STREAM_DURABLE"], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.stream, "REQUESTS");
            assert_eq!(config.subject, "request.queue.priority");
            assert_eq!(config.durable, "request-queue-consumer");
            assert_eq!(config.stream_subjects(), "request.queue.>");
        });
    }

    #[test]
    fn test_stream_subjects_for_single_token() {
        temp_env::with_var("STREAM_SUBJECT", Some("jobs"), || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.stream_subjects(), "jobs");
        });
    }
}
