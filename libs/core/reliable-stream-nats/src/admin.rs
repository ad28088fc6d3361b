//! Stream provisioning for setup tooling and tests.

use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{self, DiscardPolicy, RetentionPolicy, StorageType};
use async_nats::jetstream::Context;
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::error::NatsError;

/// Creates and deletes work-queue streams.
#[derive(Clone)]
pub struct StreamAdmin {
    jetstream: Context,
}

impl StreamAdmin {
    pub fn new(jetstream: Context) -> Self {
        Self { jetstream }
    }

    /// Create a file-backed work-queue stream; each message is removed once acked.
    pub async fn create_work_queue_stream(
        &self,
        name: &str,
        subjects: &[&str],
    ) -> Result<stream::Info, NatsError> {
        info!(stream = %name, subjects = ?subjects, "Creating work-queue stream");

        let stream = self
            .jetstream
            .create_stream(stream::Config {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                discard: DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(NatsError::from_jetstream_error)?;

        Ok(stream.cached_info().clone())
    }

    /// Create the durable pull consumer a subscriber will bind to.
    pub async fn create_durable_consumer(
        &self,
        stream_name: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<(), NatsError> {
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| NatsError::StreamNotFound(format!("{stream_name}: {e}")))?;

        stream
            .get_or_create_consumer(
                durable_name,
                ConsumerConfig {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(NatsError::from_jetstream_error)?;

        info!(stream = %stream_name, consumer = %durable_name, "Durable consumer ready");
        Ok(())
    }

    /// Returns whether the server reported the stream deleted.
    pub async fn delete_stream(&self, name: &str) -> Result<bool, NatsError> {
        let status = self
            .jetstream
            .delete_stream(name)
            .await
            .map_err(NatsError::from_jetstream_error)?;

        info!(stream = %name, deleted = status.success, "Deleted stream");
        Ok(status.success)
    }

    pub async fn stream_names(&self) -> Result<Vec<String>, NatsError> {
        self.jetstream
            .stream_names()
            .try_collect()
            .await
            .map_err(NatsError::from_jetstream_error)
    }

    /// Delete every stream on the server. Returns the names deleted.
    pub async fn delete_all_streams(&self) -> Result<Vec<String>, NatsError> {
        let mut deleted = Vec::new();
        for name in self.stream_names().await? {
            if self.delete_stream(&name).await? {
                deleted.push(name);
            }
        }
        debug!(count = deleted.len(), "Deleted all streams");
        Ok(deleted)
    }
}

impl std::fmt::Debug for StreamAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdmin").finish_non_exhaustive()
    }
}
