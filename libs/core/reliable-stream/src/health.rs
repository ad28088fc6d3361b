//! Connection health tracking and fetch interruption.
//!
//! The monitor is registered as a [`ConnectionListener`] and runs on the
//! connection's callback task. All of its state lives in `arc_swap` cells so
//! the callback never waits on the task that owns a fetch.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{ConnectionEvent, ConnectionListener};
use crate::metrics::StreamMetrics;

/// Health of the connection as seen by one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy(String),
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// Translates connection events into [`HealthState`] and interrupts the
/// current fetch owner when the connection goes away.
pub struct HealthMonitor {
    name: String,
    unhealthy_reason: ArcSwapOption<String>,
    fetch_owner: ArcSwapOption<CancellationToken>,
    metrics: StreamMetrics,
}

impl HealthMonitor {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let metrics = StreamMetrics::new(&name);
        Self {
            name,
            unhealthy_reason: ArcSwapOption::empty(),
            fetch_owner: ArcSwapOption::empty(),
            metrics,
        }
    }

    pub fn state(&self) -> HealthState {
        match self.unhealthy_reason.load_full() {
            Some(reason) => HealthState::Unhealthy((*reason).clone()),
            None => HealthState::Healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.unhealthy_reason.load().is_none()
    }

    /// Start over from the connection's current status and drop any stale owner.
    pub(crate) fn reset(&self, connected: bool) {
        if connected {
            self.unhealthy_reason.store(None);
        } else {
            self.unhealthy_reason
                .store(Some(Arc::new("connection not established".to_string())));
        }
        self.fetch_owner.store(None);
    }

    fn mark_unhealthy(&self, reason: String) {
        let previous = self.unhealthy_reason.swap(Some(Arc::new(reason.clone())));
        if previous.is_none() {
            warn!(name = %self.name, reason = %reason, "Connection unhealthy");
            self.metrics.health_changed(false);
        }
    }

    fn mark_healthy(&self) {
        if self.unhealthy_reason.swap(None).is_some() {
            info!(name = %self.name, "Connection healthy again");
            self.metrics.health_changed(true);
        }
    }

    /// Claim the single fetch slot for `token`.
    ///
    /// Returns `None` if another fetch already holds it. The slot is released
    /// when the returned claim is dropped.
    pub(crate) fn claim_fetch(&self, token: Arc<CancellationToken>) -> Option<FetchClaim<'_>> {
        let previous = self
            .fetch_owner
            .compare_and_swap(&None::<Arc<CancellationToken>>, Some(token.clone()));
        if previous.is_some() {
            return None;
        }

        Some(FetchClaim {
            owners: &self.fetch_owner,
            token,
        })
    }

    /// Take the current fetch owner, if any, and cancel its token.
    pub(crate) fn interrupt_fetch(&self) -> bool {
        match self.fetch_owner.swap(None) {
            Some(owner) => {
                owner.cancel();
                true
            }
            None => false,
        }
    }
}

impl ConnectionListener for HealthMonitor {
    fn on_event(&self, event: &ConnectionEvent) {
        match event {
            loss if loss.is_connection_loss() => {
                // Health first, so a woken fetch sees the reason.
                self.mark_unhealthy(format!("connection problem: {loss}"));
                if self.interrupt_fetch() {
                    debug!(name = %self.name, event = %loss, "Interrupted in-flight fetch");
                }
            }
            ConnectionEvent::Connected => self.mark_healthy(),
            other => debug!(name = %self.name, event = %other, "Ignoring connection event"),
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("fetch_in_flight", &self.fetch_owner.load().is_some())
            .finish()
    }
}

/// Held for the duration of one fetch; releases the slot on drop.
pub(crate) struct FetchClaim<'a> {
    owners: &'a ArcSwapOption<CancellationToken>,
    token: Arc<CancellationToken>,
}

impl Drop for FetchClaim<'_> {
    fn drop(&mut self) {
        // Only clear the slot if it is still ours; the monitor may have taken it.
        let ours = Some(self.token.clone());
        let _ = self
            .owners
            .compare_and_swap(&ours, None::<Arc<CancellationToken>>);
    }
}
