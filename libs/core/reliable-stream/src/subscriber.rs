//! Pull subscriber state machine.
//!
//! ```text
//!   Idle ──start()──▶ Active ──stop()──▶ Idle
//!                       │
//!                       └─ healthy / unhealthy (driven by connection events)
//! ```
//!
//! One fetch at a time per subscriber. A fetch runs with an interrupt token
//! (a child of the caller's token) stored in the health monitor, so a
//! connection loss, a `stop()` or the caller can cut it short. Messages that
//! were already received are always returned, even when the fetch was
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Connection, ListenerId, PullSubscription};
use crate::compat::{self, Absorbed};
use crate::config::SubscriberConfig;
use crate::envelope::Envelope;
use crate::error::{BrokerFault, StreamError};
use crate::health::{FetchClaim, HealthMonitor, HealthState};
use crate::metrics::StreamMetrics;

struct ActiveSubscription<S> {
    subscription: S,
    listener_id: ListenerId,
}

/// Cancellation-aware pull subscriber for one subject and durable consumer.
///
/// # Example
///
/// ```ignore
/// let subscriber = ReliablePullSubscriber::new(
///     connection,
///     SubscriberConfig::new("request.queue.priority", "request-queue-consumer"),
/// );
/// subscriber.start().await?;
///
/// if let Some(message) = subscriber.next_message(Duration::from_secs(30), &cancel).await? {
///     message.ack(&cancel).await?;
/// }
/// ```
pub struct ReliablePullSubscriber<C: Connection> {
    connection: C,
    config: SubscriberConfig,
    monitor: Arc<HealthMonitor>,
    active: ArcSwapOption<ActiveSubscription<C::Subscription>>,
    metrics: StreamMetrics,
}

impl<C: Connection> ReliablePullSubscriber<C> {
    pub fn new(connection: C, config: SubscriberConfig) -> Self {
        let name = format!("{}/{}", config.subject, config.durable_name);
        Self {
            connection,
            monitor: Arc::new(HealthMonitor::new(name.clone())),
            metrics: StreamMetrics::new(&name),
            config,
            active: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load().is_some()
    }

    /// Active and not flagged unhealthy by a connection event.
    pub fn is_healthy(&self) -> bool {
        self.is_active() && self.monitor.is_healthy()
    }

    pub fn health(&self) -> HealthState {
        self.monitor.state()
    }

    /// Create the pull subscription and start listening for connection events.
    #[instrument(skip(self), fields(subject = %self.config.subject, durable = %self.config.durable_name))]
    pub async fn start(&self) -> Result<&Self, StreamError> {
        if self.is_active() {
            return Err(StreamError::unrecoverable("subscriber already active"));
        }

        let subscription = self
            .connection
            .pull_subscription(&self.config.subject, &self.config.durable_name)
            .await
            .map_err(|fault| {
                StreamError::unrecoverable_with_source(
                    format!("failed to subscribe to {}", self.config.subject),
                    fault,
                )
            })?;

        // Listener only after the subscription exists, so a failed start leaks nothing.
        self.monitor.reset(self.connection.is_connected());
        let listener_id = self.connection.add_listener(self.monitor.clone());
        let active = Arc::new(ActiveSubscription {
            subscription,
            listener_id,
        });

        let lost_race = self
            .active
            .compare_and_swap(
                &None::<Arc<ActiveSubscription<C::Subscription>>>,
                Some(active.clone()),
            )
            .is_some();
        if lost_race {
            self.connection.remove_listener(listener_id);
            if let Err(fault) = active.subscription.unsubscribe().await {
                warn!(error = %fault, "Failed to unsubscribe duplicate subscription (ignored)");
            }
            return Err(StreamError::unrecoverable("subscriber already active"));
        }

        info!("Subscriber started");
        Ok(self)
    }

    /// Tear down the subscription. Never fails and may be called in any state.
    ///
    /// A fetch in flight on another task is interrupted and reports unrecoverable.
    #[instrument(skip(self), fields(subject = %self.config.subject, durable = %self.config.durable_name))]
    pub async fn stop(&self) {
        let Some(active) = self.active.swap(None) else {
            debug!("Subscriber not active, nothing to stop");
            return;
        };

        if self.monitor.interrupt_fetch() {
            debug!("Interrupted in-flight fetch");
        }

        if let Err(fault) = active.subscription.unsubscribe().await {
            warn!(error = %fault, "Failed to unsubscribe (ignored)");
        }
        self.connection.remove_listener(active.listener_id);

        info!("Subscriber stopped");
    }

    /// Fetch at most one message, `None` if nothing arrived within `timeout`.
    pub async fn next_message(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Envelope>, StreamError> {
        let messages = self.next_messages(1, timeout, cancel).await?;
        Ok(messages.into_iter().next())
    }

    /// Fetch up to `batch_size` messages, waiting at most `timeout` for the first.
    ///
    /// Returns early with a partial batch once something has arrived. An empty
    /// vector means nothing was available.
    #[instrument(skip(self, cancel), fields(subject = %self.config.subject, durable = %self.config.durable_name))]
    pub async fn next_messages(
        &self,
        batch_size: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, StreamError> {
        let result = self.fetch(batch_size, timeout, cancel).await;
        match &result {
            Ok(messages) => self.metrics.fetch_completed(messages.len()),
            Err(err) => self.metrics.fetch_failed(err.kind()),
        }
        result
    }

    async fn fetch(
        &self,
        batch_size: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let Some(active) = self.active.load_full() else {
            return Err(StreamError::unrecoverable(
                "not subscribed (start() must be called first)",
            ));
        };

        if batch_size == 0 {
            return Err(StreamError::unrecoverable("batch size must be at least 1"));
        }

        if let HealthState::Unhealthy(reason) = self.monitor.state() {
            return Err(StreamError::recoverable(reason));
        }

        let interrupt = Arc::new(cancel.child_token());
        let claim = self.claim(interrupt.clone())?;

        let deadline = timeout.saturating_add(self.config.fetch_grace);
        let outcome = tokio::time::timeout(
            deadline,
            active.subscription.fetch(batch_size, timeout, &interrupt),
        )
        .await;
        drop(claim);

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(fault)) => match compat::absorb(fault, cancel) {
                Absorbed::Cancelled => return Err(StreamError::Cancelled),
                Absorbed::Swallowed(_) => Vec::new(),
                Absorbed::Unhandled(fault) => return Err(self.classify_fault(fault)),
            },
            Err(_) => {
                return Err(self.classify_fault(BrokerFault::TimedOut(format!(
                    "fetch did not return within {deadline:?}"
                ))))
            }
        };

        // Data wins over any cancellation that raced with it.
        if !raw.is_empty() {
            debug!(count = raw.len(), "Fetched messages");
            return Ok(raw.into_iter().map(Envelope::from).collect());
        }

        if cancel.is_cancelled() || interrupt.is_cancelled() {
            return Err(self.interrupted(&active, cancel));
        }

        Ok(Vec::new())
    }

    /// Take the fetch slot, then re-read health: a connection loss that
    /// landed before the slot was taken had no owner to interrupt.
    fn claim(&self, interrupt: Arc<CancellationToken>) -> Result<FetchClaim<'_>, StreamError> {
        let Some(claim) = self.monitor.claim_fetch(interrupt) else {
            return Err(StreamError::unrecoverable(
                "only one fetch at a time is permitted per subscriber",
            ));
        };
        if let HealthState::Unhealthy(reason) = self.monitor.state() {
            return Err(StreamError::recoverable(reason));
        }
        Ok(claim)
    }

    /// Explain why an empty fetch was cut short.
    fn interrupted(
        &self,
        active: &Arc<ActiveSubscription<C::Subscription>>,
        cancel: &CancellationToken,
    ) -> StreamError {
        if let HealthState::Unhealthy(reason) = self.monitor.state() {
            return StreamError::recoverable(reason);
        }
        if cancel.is_cancelled() {
            return StreamError::Cancelled;
        }
        if !self.is_current(active) {
            return StreamError::unrecoverable("subscription stopped during fetch");
        }
        // Connection dropped and came back while we were waiting.
        StreamError::recoverable("fetch interrupted by a connection event")
    }

    fn classify_fault(&self, fault: BrokerFault) -> StreamError {
        if let HealthState::Unhealthy(reason) = self.monitor.state() {
            return StreamError::recoverable_with_source(reason, fault);
        }
        StreamError::from_fault("fetch failed", fault)
    }

    fn is_current(&self, active: &Arc<ActiveSubscription<C::Subscription>>) -> bool {
        self.active
            .load()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, active))
    }
}

impl<C: Connection> Drop for ReliablePullSubscriber<C> {
    fn drop(&mut self) {
        if let Some(active) = self.active.swap(None) {
            self.monitor.interrupt_fetch();
            self.connection.remove_listener(active.listener_id);
        }
    }
}

impl<C: Connection> std::fmt::Debug for ReliablePullSubscriber<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliablePullSubscriber")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .field("monitor", &self.monitor)
            .finish()
    }
}
