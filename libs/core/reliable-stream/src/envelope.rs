//! Received message wrapper.

use std::fmt::{self, Write as _};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::{Acknowledger, Headers, RawMessage};
use crate::compat::{self, Absorbed};
use crate::error::StreamError;

/// Payload bytes rendered by [`Envelope::dump`].
pub const DEFAULT_DUMP_LIMIT: usize = 255;

/// One message returned by a fetch.
///
/// Immutable; acknowledging it is always an explicit call.
pub struct Envelope {
    subject: String,
    headers: Headers,
    payload: Bytes,
    sequence: u64,
    acker: Box<dyn Acknowledger>,
}

impl Envelope {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Stream sequence number assigned when the message was stored.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Acknowledge without waiting for the server.
    ///
    /// A cancelled token does not prevent the ack, so messages fetched before
    /// shutdown can still be drained.
    pub async fn ack(&self, cancel: &CancellationToken) -> Result<(), StreamError> {
        let result = self.acker.ack().await;
        self.classify_ack(result, cancel)
    }

    /// Acknowledge and wait up to `timeout` for the server to confirm.
    pub async fn ack_sync(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let result = self.acker.ack_sync(timeout).await;
        self.classify_ack(result, cancel)
    }

    fn classify_ack(
        &self,
        result: Result<(), crate::error::BrokerFault>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let Err(fault) = result else {
            debug!(subject = %self.subject, sequence = self.sequence, "Message acknowledged");
            return Ok(());
        };

        match compat::absorb(fault, cancel) {
            Absorbed::Cancelled => Err(StreamError::Cancelled),
            Absorbed::Swallowed(_) => Ok(()),
            Absorbed::Unhandled(fault) => Err(StreamError::from_fault(
                format!("failed to acknowledge message {}", self.sequence),
                fault,
            )),
        }
    }

    /// Multi-line rendering for debug logs, payload capped at [`DEFAULT_DUMP_LIMIT`] bytes.
    pub fn dump(&self) -> String {
        self.dump_with_limit(DEFAULT_DUMP_LIMIT)
    }

    pub fn dump_with_limit(&self, max_payload: usize) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "subject: {}", self.subject);
        let _ = writeln!(out, "sequence: {}", self.sequence);

        if !self.headers.is_empty() {
            let _ = writeln!(out, "headers: count={}", self.headers.len());
            for (name, value) in self.headers.iter() {
                let _ = writeln!(out, "  {name}: {value}");
            }
        }

        let _ = writeln!(out, "data: bytes={}", self.payload.len());
        if !self.payload.is_empty() {
            if self.payload.len() > max_payload {
                let shown = String::from_utf8_lossy(&self.payload[..max_payload]);
                let _ = writeln!(out, " {shown}");
                let _ = writeln!(
                    out,
                    " <truncated {} bytes>",
                    self.payload.len() - max_payload
                );
            } else {
                let _ = writeln!(out, " {}", String::from_utf8_lossy(&self.payload));
            }
        }

        out
    }
}

impl From<RawMessage> for Envelope {
    fn from(raw: RawMessage) -> Self {
        Self {
            subject: raw.subject,
            headers: raw.headers,
            payload: raw.payload,
            sequence: raw.sequence,
            acker: raw.acker,
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerFault;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedAcker {
        result: Result<(), BrokerFault>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acknowledger for ScriptedAcker {
        async fn ack(&self) -> Result<(), BrokerFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }

        async fn ack_sync(&self, _timeout: Duration) -> Result<(), BrokerFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn envelope(payload: &'static [u8], result: Result<(), BrokerFault>) -> (Envelope, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let raw = RawMessage {
            subject: "orders.created".to_string(),
            headers: [("trace-id", "abc")].into_iter().collect(),
            payload: Bytes::from_static(payload),
            sequence: 7,
            acker: Box::new(ScriptedAcker {
                result,
                calls: calls.clone(),
            }),
        };
        (Envelope::from(raw), calls)
    }

    #[tokio::test]
    async fn test_ack_success() {
        let (message, calls) = envelope(b"hello", Ok(()));
        let cancel = CancellationToken::new();

        message.ack(&cancel).await.unwrap();
        message.ack_sync(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ack_after_cancellation_still_acknowledges() {
        let (message, calls) = envelope(b"hello", Ok(()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        message.ack(&cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ack_classifies_faults() {
        let cancel = CancellationToken::new();

        let (message, _) = envelope(b"x", Err(BrokerFault::Disconnected("lost".into())));
        assert!(message.ack(&cancel).await.unwrap_err().is_recoverable());

        let (message, _) = envelope(b"x", Err(BrokerFault::IllegalState("closed".into())));
        let err = message
            .ack_sync(Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn test_ack_swallows_spurious_lock_release() {
        let (message, _) = envelope(b"x", Err(BrokerFault::SpuriousLockRelease("unlock".into())));
        let cancel = CancellationToken::new();
        message.ack(&cancel).await.unwrap();

        cancel.cancel();
        assert!(message.ack(&cancel).await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_dump_renders_all_sections() {
        let (message, _) = envelope(b"Hello 1", Ok(()));
        let dump = message.dump();

        assert_eq!(
            dump,
            "subject: orders.created\nsequence: 7\nheaders: count=1\n  trace-id: abc\ndata: bytes=7\n Hello 1\n"
        );
    }

    #[test]
    fn test_dump_truncates_long_payloads() {
        let (message, _) = envelope(b"0123456789", Ok(()));
        let dump = message.dump_with_limit(4);

        assert!(dump.contains("data: bytes=10\n 0123\n"));
        assert!(dump.contains(" <truncated 6 bytes>\n"));
    }

    #[test]
    fn test_dump_empty_payload() {
        let (message, _) = envelope(b"", Ok(()));
        assert!(message.dump().ends_with("data: bytes=0\n"));
    }
}
