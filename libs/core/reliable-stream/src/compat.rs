//! Compatibility shim for the spurious lock-release fault.
//!
//! Some client releases raise a lock/monitor release error while an
//! interrupted call unwinds, even though nothing is actually wrong. Every
//! place that has to tolerate it goes through [`absorb`]; once no supported
//! backend reports [`BrokerFault::SpuriousLockRelease`] this module can be
//! deleted along with its three call sites.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BrokerFault;

/// Outcome of running a fault through the shim.
#[derive(Debug)]
pub(crate) enum Absorbed {
    /// The quirk masked a real cancellation.
    Cancelled,
    /// The quirk was benign. The caller decides what "benign" means for its operation.
    Swallowed(BrokerFault),
    /// Not the quirk; classify normally.
    Unhandled(BrokerFault),
}

pub(crate) fn absorb(fault: BrokerFault, cancel: &CancellationToken) -> Absorbed {
    match fault {
        quirk @ BrokerFault::SpuriousLockRelease(_) => {
            if cancel.is_cancelled() {
                Absorbed::Cancelled
            } else {
                debug!(fault = %quirk, "Ignoring spurious lock release");
                Absorbed::Swallowed(quirk)
            }
        }
        other => Absorbed::Unhandled(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quirk_swallowed_without_cancellation() {
        let cancel = CancellationToken::new();
        let outcome = absorb(BrokerFault::SpuriousLockRelease("unlock".into()), &cancel);
        assert!(matches!(outcome, Absorbed::Swallowed(_)));
    }

    #[test]
    fn test_cancellation_wins_over_quirk() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = absorb(BrokerFault::SpuriousLockRelease("unlock".into()), &cancel);
        assert!(matches!(outcome, Absorbed::Cancelled));
    }

    #[test]
    fn test_other_faults_pass_through() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = absorb(BrokerFault::Io("reset".into()), &cancel);
        assert!(matches!(outcome, Absorbed::Unhandled(BrokerFault::Io(_))));
    }
}
