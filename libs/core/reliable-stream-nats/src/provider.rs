//! Lazily established, process-wide connection.

use core_config::{FromEnv, NatsConfig};
use tokio::sync::OnceCell;

use crate::connection::NatsConnection;
use crate::error::NatsError;

/// Connects on first use and hands out clones of the same connection.
///
/// A failed attempt leaves the provider empty so the next call retries.
#[derive(Debug)]
pub struct ConnectionProvider {
    config: NatsConfig,
    connection: OnceCell<NatsConnection>,
}

impl ConnectionProvider {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            connection: OnceCell::new(),
        }
    }

    pub fn from_env() -> Result<Self, NatsError> {
        Ok(Self::new(NatsConfig::from_env()?))
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub async fn get(&self) -> Result<NatsConnection, NatsError> {
        self.connection
            .get_or_try_init(|| NatsConnection::connect(&self.config))
            .await
            .cloned()
    }

    /// The connection, if one has been established.
    pub fn current(&self) -> Option<NatsConnection> {
        self.connection.get().cloned()
    }
}
