use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportResult;

/// Client side of the messaging system.
///
/// Delivery is at-least-once: a request that timed out may still have been
/// processed, so handlers must tolerate redelivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` on `subject` and wait for the single reply.
    async fn request(&self, subject: &str, payload: Bytes) -> TransportResult<Bytes>;

    /// Fire-and-forget delivery on `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;

    /// Flush pending publishes and stop accepting new messages.
    async fn close(&self) -> TransportResult<()>;
}

/// Server side: answers requests arriving on object store subjects.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and produce the reply payload.
    async fn handle(&self, subject: &str, payload: Bytes) -> Bytes;

    /// Handle a published message; there is no reply.
    async fn notify(&self, subject: &str, payload: Bytes) {
        let _ = self.handle(subject, payload).await;
    }
}
