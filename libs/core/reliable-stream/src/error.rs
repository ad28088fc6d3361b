//! Error taxonomy for stream operations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a failed operation means for the caller.
///
/// # Kinds
///
/// - **Recoverable**: transient connectivity problem, wait briefly and retry the same call
/// - **Unrecoverable**: structural problem, stop/start (or rebuild) before retrying
/// - **Cancellation**: the caller asked to stop, exit the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Disconnect, lame duck, reconnect in progress.
    /// Retry in place with 1-30s exponential backoff.
    Recoverable,

    /// Never started, started twice, resource destroyed, ownership violation.
    /// Restart the component, then retry after 5s.
    Unrecoverable,

    /// Cooperative cancellation, never retried.
    Cancellation,
}

impl FaultKind {
    /// Get the base backoff delay in milliseconds.
    pub fn base_backoff_ms(&self) -> u64 {
        match self {
            FaultKind::Recoverable => 1000,   // 1s
            FaultKind::Unrecoverable => 5000, // 5s, fixed
            FaultKind::Cancellation => 0,     // No retry
        }
    }

    /// Get the maximum backoff delay in milliseconds.
    pub fn max_backoff_ms(&self) -> u64 {
        match self {
            FaultKind::Recoverable => 30_000, // 30s
            FaultKind::Unrecoverable => 5000,
            FaultKind::Cancellation => 0,
        }
    }

    /// Suggested wait before the next attempt, `None` when the caller should stop.
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        if *self == FaultKind::Cancellation {
            return None;
        }

        let base = self.base_backoff_ms();
        let delay = base.saturating_mul(2u64.saturating_pow(attempt));
        let capped = if *self == FaultKind::Unrecoverable {
            base
        } else {
            delay.min(self.max_backoff_ms())
        };
        Some(Duration::from_millis(capped))
    }

    /// Whether the component must be torn down before retrying.
    pub fn requires_restart(&self) -> bool {
        matches!(self, FaultKind::Unrecoverable)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Recoverable => write!(f, "recoverable"),
            FaultKind::Unrecoverable => write!(f, "unrecoverable"),
            FaultKind::Cancellation => write!(f, "cancelled"),
        }
    }
}

/// Raw fault reported by a broker backend.
///
/// Never returned from a public operation on its own; it only travels as the
/// source of a [`StreamError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerFault {
    /// Connection lost or reconnect in progress
    #[error("connection unavailable: {0}")]
    Disconnected(String),

    /// Server did not answer in time
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Transport failure
    #[error("io error: {0}")]
    Io(String),

    /// Error reply from the stream API
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stream or consumer does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection closed, consumer deleted or another broken invariant
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Lock release failure raised while an interrupted call unwinds
    #[error("spurious lock release: {0}")]
    SpuriousLockRelease(String),

    /// Anything the backend cannot disambiguate
    #[error("{0}")]
    Other(String),
}

impl BrokerFault {
    /// Default classification of this fault.
    ///
    /// Unknown or broken-invariant faults are unrecoverable.
    pub fn kind(&self) -> FaultKind {
        match self {
            BrokerFault::Disconnected(_)
            | BrokerFault::TimedOut(_)
            | BrokerFault::Io(_)
            | BrokerFault::Protocol(_) => FaultKind::Recoverable,
            BrokerFault::NotFound(_)
            | BrokerFault::IllegalState(_)
            | BrokerFault::SpuriousLockRelease(_)
            | BrokerFault::Other(_) => FaultKind::Unrecoverable,
        }
    }
}

/// Error returned by every publisher, subscriber and envelope operation.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Retry the same operation after a short wait
    #[error("recoverable: {message}")]
    Recoverable {
        message: String,
        #[source]
        source: Option<BrokerFault>,
    },

    /// Rebuild the publisher or subscriber before retrying
    #[error("unrecoverable: {message}")]
    Unrecoverable {
        message: String,
        #[source]
        source: Option<BrokerFault>,
    },

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    /// Create a recoverable error.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a recoverable error with the fault that caused it.
    pub fn recoverable_with_source(message: impl Into<String>, source: BrokerFault) -> Self {
        Self::Recoverable {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an unrecoverable error.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unrecoverable error with the fault that caused it.
    pub fn unrecoverable_with_source(message: impl Into<String>, source: BrokerFault) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Classify a broker fault using its default kind.
    pub fn from_fault(message: impl Into<String>, fault: BrokerFault) -> Self {
        match fault.kind() {
            FaultKind::Recoverable => Self::recoverable_with_source(message, fault),
            _ => Self::unrecoverable_with_source(message, fault),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            StreamError::Recoverable { .. } => FaultKind::Recoverable,
            StreamError::Unrecoverable { .. } => FaultKind::Unrecoverable,
            StreamError::Cancelled => FaultKind::Cancellation,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Recoverable { .. })
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, StreamError::Unrecoverable { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }

    /// Human readable reason, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            StreamError::Recoverable { message, .. } | StreamError::Unrecoverable { message, .. } => {
                message
            }
            StreamError::Cancelled => "operation cancelled",
        }
    }

    /// Underlying broker fault, if any.
    pub fn fault(&self) -> Option<&BrokerFault> {
        match self {
            StreamError::Recoverable { source, .. } | StreamError::Unrecoverable { source, .. } => {
                source.as_ref()
            }
            StreamError::Cancelled => None,
        }
    }

    /// Suggested wait before attempt `attempt`, `None` when the caller should stop.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        self.kind().backoff_delay(attempt)
    }
}
