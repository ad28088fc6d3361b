use std::time::Duration;

use crate::{env_or_default, ConfigError, FromEnv};

pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_CONNECTION_NAME: &str = "reliable-stream";

/// NATS connection configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsConfig {
    pub url: String,
    pub connection_name: String,
    pub connect_timeout: Duration,
    /// `None` keeps reconnecting forever.
    pub max_reconnects: Option<usize>,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            connection_name: DEFAULT_CONNECTION_NAME.to_string(),
            connect_timeout: Duration::from_secs(5),
            max_reconnects: None,
        }
    }
}

impl FromEnv for NatsConfig {
    /// Every variable is optional:
    /// NATS_URL, NATS_CONNECTION_NAME, NATS_CONNECT_TIMEOUT_SECS, NATS_MAX_RECONNECTS
    fn from_env() -> Result<Self, ConfigError> {
        let connect_timeout = parse_var::<u64>("NATS_CONNECT_TIMEOUT_SECS", "5")?;
        let max_reconnects = match env_or_default("NATS_MAX_RECONNECTS", "").as_str() {
            "" => None,
            _ => Some(parse_var::<usize>("NATS_MAX_RECONNECTS", "0")?),
        };

        Ok(Self {
            url: env_or_default("NATS_URL", DEFAULT_NATS_URL),
            connection_name: env_or_default("NATS_CONNECTION_NAME", DEFAULT_CONNECTION_NAME),
            connect_timeout: Duration::from_secs(connect_timeout),
            max_reconnects,
        })
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_or_default(key, default)
        .parse()
        .map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 4] = [
        "NATS_URL",
        "NATS_CONNECTION_NAME",
        "NATS_CONNECT_TIMEOUT_SECS",
        "NATS_MAX_RECONNECTS",
    ];

    #[test]
    fn test_nats_config_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = NatsConfig::from_env().unwrap();
            assert_eq!(config, NatsConfig::default());
            assert_eq!(config.url, "nats://localhost:4222");
            assert_eq!(config.connect_timeout, Duration::from_secs(5));
            assert_eq!(config.max_reconnects, None);
        });
    }

    #[test]
    fn test_nats_config_from_env() {
        temp_env::with_vars(
            [
                ("NATS_URL", Some("nats://nats.internal:4222")),
                ("NATS_CONNECTION_NAME", Some("orders-worker")),
                ("NATS_CONNECT_TIMEOUT_SECS", Some("12")),
                ("NATS_MAX_RECONNECTS", Some("3")),
            ],
            || {
                let config = NatsConfig::from_env().unwrap();
                assert_eq!(config.url, "nats://nats.internal:4222");
                assert_eq!(config.connection_name, "orders-worker");
                assert_eq!(config.connect_timeout, Duration::from_secs(12));
                assert_eq!(config.max_reconnects, Some(3));
            },
        );
    }

    #[test]
    fn test_nats_config_invalid_timeout() {
        temp_env::with_var("NATS_CONNECT_TIMEOUT_SECS", Some("soon"), || {
            let err = NatsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NATS_CONNECT_TIMEOUT_SECS"));
        });
    }

    #[test]
    fn test_nats_config_builder() {
        let config = NatsConfig::new("nats://other:4222").with_connection_name("demo");
        assert_eq!(config.url, "nats://other:4222");
        assert_eq!(config.connection_name, "demo");
        assert_eq!(config.max_reconnects, None);
    }
}
