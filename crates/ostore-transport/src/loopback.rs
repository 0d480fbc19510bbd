use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::traits::{RequestHandler, Transport};

/// In-process transport that hands every message straight to a handler.
///
/// Subjects must start with `prefix` to reach the handler; anything else has
/// no responders, as on a real messaging system.
pub struct LoopbackTransport {
    handler: Arc<dyn RequestHandler>,
    prefix: String,
    closed: AtomicBool,
    requests: AtomicU64,
}

impl LoopbackTransport {
    /// Route subjects starting with `prefix` to `handler`.
    pub fn new(handler: Arc<dyn RequestHandler>, prefix: impl Into<String>) -> Self {
        Self {
            handler,
            prefix: prefix.into(),
            closed: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        }
    }

    /// Number of requests and publishes delivered so far.
    pub fn delivered(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn route(&self, subject: &str) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !subject.starts_with(&self.prefix) {
            return Err(TransportError::NoResponders(subject.into()));
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn request(&self, subject: &str, payload: Bytes) -> TransportResult<Bytes> {
        self.route(subject)?;
        debug!(subject, bytes = payload.len(), "loopback request");
        Ok(self.handler.handle(subject, payload).await)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.route(subject)?;
        debug!(subject, bytes = payload.len(), "loopback publish");
        self.handler.notify(subject, payload).await;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("prefix", &self.prefix)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
