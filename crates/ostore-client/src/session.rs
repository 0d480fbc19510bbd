use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ostore_protocol::{StoreCodec, StoreMessage, Subject};
use ostore_transport::{Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Counters of a [`TransferSession`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes: u64,
    pub chunks: u64,
    /// Requests sent again after a transient failure.
    pub retries: u64,
}

/// A cancellable unit of work (one put or one get) bound to a transport.
///
/// Every request carries a round-trip timeout and is retried with
/// exponential backoff on transient transport errors, up to
/// `max_retries` times, before failing with
/// [`StoreError::TransferTimeout`]. Cancelling the session aborts the
/// request in flight; the owning operation cleans up after itself.
pub struct TransferSession {
    transport: Arc<dyn Transport>,
    config: StoreConfig,
    cancel: CancellationToken,
    bytes: AtomicU64,
    chunks: AtomicU64,
    retries: AtomicU64,
}

impl TransferSession {
    pub fn new(transport: Arc<dyn Transport>, config: StoreConfig, cancel: CancellationToken) -> Self {
        Self {
            transport,
            config,
            cancel,
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn record_chunk(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `fut` unless the session is cancelled first.
    pub async fn guard<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            res = fut => res,
        }
    }

    /// Send `msg` on `subject` and decode the reply. Error replies from the
    /// service are mapped to [`StoreError`].
    pub async fn request(&self, subject: &Subject, msg: &StoreMessage) -> StoreResult<StoreMessage> {
        let subject = subject.to_string();
        let payload = StoreCodec::encode(msg)?;
        let timeout = self.config.chunk_timeout();
        let mut attempt = 0u32;
        loop {
            let round_trip =
                tokio::time::timeout(timeout, self.transport.request(&subject, payload.clone()));
            let sent = self.guard(async { Ok(round_trip.await) }).await?;
            let err = match sent {
                Ok(Ok(reply)) => {
                    return match StoreCodec::decode_exact(&reply)? {
                        StoreMessage::Error { code, message } => {
                            Err(StoreError::from_reply(code, message))
                        }
                        reply => Ok(reply),
                    };
                }
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => TransportError::Timeout {
                    subject: subject.clone(),
                },
            };
            if attempt >= self.config.max_retries {
                warn!(%subject, attempts = attempt + 1, error = %err, "request failed after all attempts");
                return Err(StoreError::TransferTimeout {
                    subject,
                    attempts: attempt + 1,
                });
            }
            let delay = self.config.retry_delay(attempt);
            debug!(
                %subject,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "request failed, retrying"
            );
            self.guard(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fire-and-forget delivery. Not subject to cancellation, so cleanup
    /// still goes out after a cancelled transfer.
    pub async fn publish(&self, subject: &Subject, msg: &StoreMessage) -> StoreResult<()> {
        let payload = StoreCodec::encode(msg)?;
        self.transport.publish(&subject.to_string(), payload).await?;
        Ok(())
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("cancelled", &self.is_cancelled())
            .field("stats", &self.stats())
            .finish()
    }
}
