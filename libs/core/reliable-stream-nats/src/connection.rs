//! NATS connection wrapper implementing [`reliable_stream::Connection`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_nats::connection::State;
use async_nats::jetstream::{self, Context};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use core_config::NatsConfig;
use reliable_stream::{BrokerFault, Connection, ConnectionEvent, ConnectionListener, ListenerId};
use tracing::{debug, info, warn};

use crate::admin::StreamAdmin;
use crate::consumer::NatsSubscription;
use crate::error::NatsError;
use crate::producer::NatsPublisher;

/// Listeners registered on one connection.
///
/// Dispatch clones the current set first so a listener may add or remove
/// listeners from inside `on_event`.
#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Arc<dyn ConnectionListener>>>,
}

impl ListenerRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ListenerId, Arc<dyn ConnectionListener>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, listener);
        id
    }

    fn remove(&self, id: ListenerId) {
        self.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn dispatch(&self, event: &ConnectionEvent) {
        let listeners: Vec<_> = self.lock().values().cloned().collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}

/// State shared by the connection and everything created from it, used to
/// turn client errors into [`BrokerFault`]s.
#[derive(Clone)]
pub(crate) struct Link {
    client: Client,
    closed: Arc<AtomicBool>,
}

impl Link {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.is_closed() && matches!(self.client.connection_state(), State::Connected)
    }

    /// Fail fast when the connection cannot carry a request.
    pub(crate) fn check(&self) -> Result<(), BrokerFault> {
        if self.is_closed() {
            Err(BrokerFault::IllegalState("connection closed".into()))
        } else if !self.is_connected() {
            Err(BrokerFault::Disconnected("not connected to server".into()))
        } else {
            Ok(())
        }
    }

    /// Attribute an error to the connection when it is down, otherwise to
    /// the operation via `fallback`.
    pub(crate) fn fault(
        &self,
        fallback: impl FnOnce(String) -> BrokerFault,
        error: impl fmt::Display,
    ) -> BrokerFault {
        if self.is_closed() {
            BrokerFault::IllegalState(format!("connection closed: {error}"))
        } else if !self.is_connected() {
            BrokerFault::Disconnected(error.to_string())
        } else {
            fallback(error.to_string())
        }
    }
}

/// A connection to a NATS server with JetStream.
///
/// Cheap to clone; clones share the client and listener registry.
#[derive(Clone)]
pub struct NatsConnection {
    link: Link,
    jetstream: Context,
    listeners: Arc<ListenerRegistry>,
    name: Arc<str>,
}

impl NatsConnection {
    /// Connect using `config`, reconnecting in the background on failure.
    pub async fn connect(config: &NatsConfig) -> Result<Self, NatsError> {
        let listeners = Arc::new(ListenerRegistry::default());
        let closed = Arc::new(AtomicBool::new(false));

        let callback_listeners = listeners.clone();
        let callback_closed = closed.clone();
        let client = ConnectOptions::new()
            .name(&config.connection_name)
            .connection_timeout(config.connect_timeout)
            .max_reconnects(config.max_reconnects)
            .event_callback(move |event| {
                let listeners = callback_listeners.clone();
                let closed = callback_closed.clone();
                async move {
                    let event = map_event(event);
                    if event == ConnectionEvent::Closed {
                        closed.store(true, Ordering::SeqCst);
                    }
                    log_event(&event);
                    listeners.dispatch(&event);
                }
            })
            .connect(config.url.as_str())
            .await?;

        info!(url = %config.url, name = %config.connection_name, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            link: Link { client, closed },
            jetstream,
            listeners,
            name: Arc::from(config.connection_name.as_str()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.link.client
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }

    pub fn admin(&self) -> StreamAdmin {
        StreamAdmin::new(self.jetstream.clone())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl Connection for NatsConnection {
    type Publisher = NatsPublisher;
    type Subscription = NatsSubscription;

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    async fn publish_context(&self) -> Result<NatsPublisher, BrokerFault> {
        self.link.check()?;
        Ok(NatsPublisher::new(self.jetstream.clone(), self.link.clone()))
    }

    async fn pull_subscription(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<NatsSubscription, BrokerFault> {
        self.link.check()?;
        NatsSubscription::bind(&self.jetstream, self.link.clone(), subject, durable_name).await
    }

    async fn close(&self) -> Result<(), BrokerFault> {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.link.client.flush().await {
            warn!(connection = %self.name, error = %e, "Flush before close failed");
        }
        info!(connection = %self.name, "NATS connection closed");
        self.listeners.dispatch(&ConnectionEvent::Closed);
        Ok(())
    }
}

impl fmt::Debug for NatsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsConnection")
            .field("name", &self.name)
            .field("connected", &self.link.is_connected())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn map_event(event: Event) -> ConnectionEvent {
    match event {
        Event::Connected => ConnectionEvent::Connected,
        Event::Disconnected => ConnectionEvent::Disconnected,
        Event::LameDuckMode => ConnectionEvent::LameDuck,
        Event::Draining => ConnectionEvent::Draining,
        Event::Closed => ConnectionEvent::Closed,
        Event::SlowConsumer(_) => ConnectionEvent::SlowConsumer,
        Event::ServerError(e) => ConnectionEvent::ServerError(e.to_string()),
        Event::ClientError(e) => ConnectionEvent::ClientError(e.to_string()),
        #[allow(unreachable_patterns)]
        other => ConnectionEvent::ClientError(other.to_string()),
    }
}

fn log_event(event: &ConnectionEvent) {
    if event.is_connection_loss() {
        warn!(%event, "NATS connection event");
    } else {
        debug!(%event, "NATS connection event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        losses: AtomicUsize,
        others: AtomicUsize,
    }

    impl ConnectionListener for Counting {
        fn on_event(&self, event: &ConnectionEvent) {
            if event.is_connection_loss() {
                self.losses.fetch_add(1, Ordering::SeqCst);
            } else {
                self.others.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_map_event() {
        assert_eq!(map_event(Event::Connected), ConnectionEvent::Connected);
        assert_eq!(map_event(Event::Disconnected), ConnectionEvent::Disconnected);
        assert_eq!(map_event(Event::LameDuckMode), ConnectionEvent::LameDuck);
        assert_eq!(map_event(Event::Draining), ConnectionEvent::Draining);
        assert_eq!(map_event(Event::Closed), ConnectionEvent::Closed);
    }

    #[test]
    fn test_registry_dispatches_to_current_listeners() {
        let registry = ListenerRegistry::default();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        let first_id = registry.add(first.clone());
        let second_id = registry.add(second.clone());
        assert_ne!(first_id, second_id);
        assert_eq!(registry.len(), 2);

        registry.dispatch(&ConnectionEvent::Disconnected);
        registry.remove(first_id);
        registry.dispatch(&ConnectionEvent::Connected);

        assert_eq!(first.losses.load(Ordering::SeqCst), 1);
        assert_eq!(first.others.load(Ordering::SeqCst), 0);
        assert_eq!(second.losses.load(Ordering::SeqCst), 1);
        assert_eq!(second.others.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_listener_may_unregister_during_dispatch() {
        struct SelfRemoving {
            registry: Arc<ListenerRegistry>,
            id: Mutex<Option<ListenerId>>,
        }

        impl ConnectionListener for SelfRemoving {
            fn on_event(&self, _: &ConnectionEvent) {
                if let Some(id) = self.id.lock().unwrap().take() {
                    self.registry.remove(id);
                }
            }
        }

        let registry = Arc::new(ListenerRegistry::default());
        let listener = Arc::new(SelfRemoving {
            registry: registry.clone(),
            id: Mutex::new(None),
        });
        let id = registry.add(listener.clone());
        *listener.id.lock().unwrap() = Some(id);

        registry.dispatch(&ConnectionEvent::Closed);
        assert_eq!(registry.len(), 0);
    }
}
