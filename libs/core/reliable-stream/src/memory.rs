//! In-process work-queue broker.
//!
//! Implements the [`Connection`] contract without a server: streams with
//! work-queue retention, durable pull consumers, explicit acks and connection
//! events. Besides being usable on its own, it exposes the knobs tests need:
//! call counters, connection event injection, fault injection and stream
//! deletion.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{
    Acknowledger, Connection, ConnectionEvent, ConnectionListener, Headers, ListenerId,
    OutboundMessage, PublishAck, PublishContext, PullSubscription, RawMessage,
};
use crate::error::BrokerFault;

type FetchHook = Box<dyn FnOnce() + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// NATS-style subject match: `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    headers: Headers,
    payload: Bytes,
    sequence: u64,
}

#[derive(Debug)]
struct MemoryStream {
    subjects: Vec<String>,
    generation: u64,
    last_sequence: u64,
    ready: VecDeque<StoredMessage>,
    /// Delivered, waiting for an ack
    pending: BTreeMap<u64, StoredMessage>,
    /// durable name -> filter subject
    consumers: BTreeMap<String, String>,
}

impl MemoryStream {
    fn accepts(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn take_ready(&mut self, filter: &str, max: usize) -> Vec<StoredMessage> {
        let mut taken = Vec::new();
        let mut index = 0;
        while index < self.ready.len() && taken.len() < max {
            if subject_matches(filter, &self.ready[index].subject) {
                if let Some(message) = self.ready.remove(index) {
                    self.pending.insert(message.sequence, message.clone());
                    taken.push(message);
                }
            } else {
                index += 1;
            }
        }
        taken
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: BTreeMap<String, MemoryStream>,
    next_generation: u64,
}

impl BrokerState {
    fn stream_for_subject(&mut self, subject: &str) -> Option<(&String, &mut MemoryStream)> {
        self.streams
            .iter_mut()
            .find(|(_, stream)| stream.accepts(subject))
    }
}

#[derive(Debug, Default)]
struct InjectedFaults {
    publish: VecDeque<BrokerFault>,
    fetch: VecDeque<BrokerFault>,
    ack: VecDeque<BrokerFault>,
}

struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
    listeners: Mutex<BTreeMap<ListenerId, Arc<dyn ConnectionListener>>>,
    next_listener_id: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    fetch_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    ack_calls: AtomicUsize,
    publish_delay_ms: AtomicU64,
    fetch_ignores_timeout: AtomicBool,
    faults: Mutex<InjectedFaults>,
    fetch_hook: Mutex<Option<FetchHook>>,
}

impl Inner {
    fn check_connection(&self) -> Result<(), BrokerFault> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerFault::IllegalState("connection closed".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerFault::Disconnected("not connected".to_string()));
        }
        Ok(())
    }

    fn dispatch(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = lock(&self.listeners).values().cloned().collect();
        debug!(event = %event, listeners = listeners.len(), "Dispatching connection event");
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A connected broker without streams.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                fetch_calls: AtomicUsize::new(0),
                publish_calls: AtomicUsize::new(0),
                ack_calls: AtomicUsize::new(0),
                publish_delay_ms: AtomicU64::new(0),
                fetch_ignores_timeout: AtomicBool::new(false),
                faults: Mutex::new(InjectedFaults::default()),
                fetch_hook: Mutex::new(None),
            }),
        }
    }

    /// Create a stream with work-queue retention over `subjects`.
    pub fn create_work_queue_stream<I, S>(&self, name: &str, subjects: I) -> Result<(), BrokerFault>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        let mut state = lock(&self.inner.state);
        if state.streams.contains_key(name) {
            return Err(BrokerFault::Protocol(format!(
                "stream name already in use: {name}"
            )));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        state.streams.insert(
            name.to_string(),
            MemoryStream {
                subjects,
                generation,
                last_sequence: 0,
                ready: VecDeque::new(),
                pending: BTreeMap::new(),
                consumers: BTreeMap::new(),
            },
        );
        debug!(stream = %name, "Created work queue stream");
        Ok(())
    }

    /// Delete a stream; consumers bound to it fail on their next operation.
    pub fn delete_stream(&self, name: &str) -> Result<(), BrokerFault> {
        let removed = lock(&self.inner.state).streams.remove(name);
        if removed.is_none() {
            return Err(BrokerFault::NotFound(format!("stream not found: {name}")));
        }
        debug!(stream = %name, "Deleted stream");
        self.inner.changed.notify_waiters();
        Ok(())
    }

    pub fn stream_names(&self) -> Vec<String> {
        lock(&self.inner.state).streams.keys().cloned().collect()
    }

    /// Filter subject of a durable consumer, if it was ever bound.
    pub fn consumer_filter(&self, stream: &str, durable_name: &str) -> Option<String> {
        lock(&self.inner.state)
            .streams
            .get(stream)
            .and_then(|stream| stream.consumers.get(durable_name).cloned())
    }

    /// Messages stored in `stream`, delivered or not, that have not been acked.
    pub fn unacked_count(&self, stream: &str) -> Option<usize> {
        lock(&self.inner.state)
            .streams
            .get(stream)
            .map(|stream| stream.ready.len() + stream.pending.len())
    }

    /// Put every delivered but unacked message back in front of the queue.
    pub fn redeliver_pending(&self, stream: &str) -> usize {
        let mut state = lock(&self.inner.state);
        let Some(stream) = state.streams.get_mut(stream) else {
            return 0;
        };
        let pending = std::mem::take(&mut stream.pending);
        let count = pending.len();
        for message in pending.into_values().rev() {
            stream.ready.push_front(message);
        }
        drop(state);
        self.inner.changed.notify_waiters();
        count
    }

    /// Drop the connection; listeners see `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.dispatch(ConnectionEvent::Disconnected);
    }

    /// Restore the connection; listeners see `Connected`.
    pub fn reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!("Ignoring reconnect on a closed connection");
            return;
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.dispatch(ConnectionEvent::Connected);
        self.inner.changed.notify_waiters();
    }

    /// Deliver an arbitrary event without changing the connection status.
    pub fn emit(&self, event: ConnectionEvent) {
        self.inner.dispatch(event);
    }

    pub fn inject_publish_fault(&self, fault: BrokerFault) {
        lock(&self.inner.faults).publish.push_back(fault);
    }

    pub fn inject_fetch_fault(&self, fault: BrokerFault) {
        lock(&self.inner.faults).fetch.push_back(fault);
    }

    pub fn inject_ack_fault(&self, fault: BrokerFault) {
        lock(&self.inner.faults).ack.push_back(fault);
    }

    /// Delay every publish by `delay` before it is processed.
    pub fn set_publish_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.publish_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Make fetches wait for data or interruption only, like a backend that
    /// does not honor its timeout.
    pub fn set_fetch_ignores_timeout(&self, ignore: bool) {
        self.inner
            .fetch_ignores_timeout
            .store(ignore, Ordering::SeqCst);
    }

    /// Run `hook` at the start of the next fetch, before any injected fault.
    pub fn on_next_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.fetch_hook) = Some(Box::new(hook));
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.inner.publish_calls.load(Ordering::SeqCst)
    }

    pub fn ack_calls(&self) -> usize {
        self.inner.ack_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .field("streams", &self.stream_names())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    type Publisher = MemoryPublisher;
    type Subscription = MemorySubscription;

    fn is_connected(&self) -> bool {
        self.inner.check_connection().is_ok()
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.inner.listeners).insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock(&self.inner.listeners).remove(&id);
    }

    async fn publish_context(&self) -> Result<Self::Publisher, BrokerFault> {
        self.inner.check_connection()?;
        Ok(MemoryPublisher {
            inner: self.inner.clone(),
        })
    }

    async fn pull_subscription(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Self::Subscription, BrokerFault> {
        self.inner.check_connection()?;

        let mut state = lock(&self.inner.state);
        let Some((stream_name, stream)) = state.stream_for_subject(subject) else {
            return Err(BrokerFault::NotFound(format!(
                "no stream matches subject {subject}"
            )));
        };
        stream
            .consumers
            .insert(durable_name.to_string(), subject.to_string());

        Ok(MemorySubscription {
            inner: self.inner.clone(),
            stream: stream_name.clone(),
            generation: stream.generation,
            filter: subject.to_string(),
            durable_name: durable_name.to_string(),
            unsubscribed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> Result<(), BrokerFault> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.dispatch(ConnectionEvent::Closed);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

pub struct MemoryPublisher {
    inner: Arc<Inner>,
}

#[async_trait]
impl PublishContext for MemoryPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, BrokerFault> {
        self.inner.publish_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.inner.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(fault) = lock(&self.inner.faults).publish.pop_front() {
            return Err(fault);
        }
        self.inner.check_connection()?;

        let ack = {
            let mut state = lock(&self.inner.state);
            let Some((stream_name, stream)) = state.stream_for_subject(&message.subject) else {
                return Err(BrokerFault::Protocol(format!(
                    "no stream matches subject {}",
                    message.subject
                )));
            };
            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            stream.ready.push_back(StoredMessage {
                subject: message.subject,
                headers: message.headers,
                payload: message.payload,
                sequence,
            });
            PublishAck {
                stream: stream_name.clone(),
                sequence,
            }
        };

        self.inner.changed.notify_waiters();
        Ok(ack)
    }
}

pub struct MemorySubscription {
    inner: Arc<Inner>,
    stream: String,
    generation: u64,
    filter: String,
    durable_name: String,
    unsubscribed: AtomicBool,
}

impl MemorySubscription {
    /// Take ready messages, or report that the consumer no longer exists.
    fn poll(&self, batch_size: usize) -> Result<Vec<StoredMessage>, BrokerFault> {
        let mut state = lock(&self.inner.state);
        let stream = state
            .streams
            .get_mut(&self.stream)
            .filter(|stream| stream.generation == self.generation)
            .ok_or_else(|| {
                BrokerFault::IllegalState(format!("consumer {} deleted", self.durable_name))
            })?;

        if !self.inner.connected.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(stream.take_ready(&self.filter, batch_size))
    }

    fn to_raw(&self, message: StoredMessage) -> RawMessage {
        RawMessage {
            subject: message.subject,
            headers: message.headers,
            payload: message.payload,
            sequence: message.sequence,
            acker: Box::new(MemoryAcker {
                inner: self.inner.clone(),
                stream: self.stream.clone(),
                generation: self.generation,
                sequence: message.sequence,
            }),
        }
    }
}

#[async_trait]
impl PullSubscription for MemorySubscription {
    async fn fetch(
        &self,
        batch_size: usize,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<Vec<RawMessage>, BrokerFault> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let hook = lock(&self.inner.fetch_hook).take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(fault) = lock(&self.inner.faults).fetch.pop_front() {
            return Err(fault);
        }
        if self.unsubscribed.load(Ordering::SeqCst) {
            return Err(BrokerFault::IllegalState("subscription closed".to_string()));
        }

        // Timeouts past the clock's range wait for data or an interrupt only.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // Register interest before polling so a publish in between is not missed.
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(BrokerFault::IllegalState("connection closed".to_string()));
            }

            let batch = self.poll(batch_size)?;
            if !batch.is_empty() {
                return Ok(batch.into_iter().map(|m| self.to_raw(m)).collect());
            }

            let deadline =
                deadline.filter(|_| !self.inner.fetch_ignores_timeout.load(Ordering::SeqCst));
            let expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = interrupt.cancelled() => return Ok(Vec::new()),
                _ = expired => return Ok(Vec::new()),
                _ = &mut notified => {}
            }
        }
    }

    async fn unsubscribe(&self) -> Result<(), BrokerFault> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        self.inner.check_connection()
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    stream: String,
    generation: u64,
    sequence: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(), BrokerFault> {
        self.inner.ack_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = lock(&self.inner.faults).ack.pop_front() {
            return Err(fault);
        }
        self.inner.check_connection()?;

        let mut state = lock(&self.inner.state);
        let stream = state
            .streams
            .get_mut(&self.stream)
            .filter(|stream| stream.generation == self.generation)
            .ok_or_else(|| BrokerFault::IllegalState(format!("stream {} deleted", self.stream)))?;
        // Acking twice is harmless.
        stream.pending.remove(&self.sequence);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerFault> {
        self.settle()
    }

    async fn ack_sync(&self, _timeout: Duration) -> Result<(), BrokerFault> {
        self.settle()
    }
}
