use bytes::Bytes;
use ostore_crypto::{new_hasher, DigestHasher};
use ostore_protocol::{ApiOp, StoreCodec, StoreMessage, Subject};
use ostore_types::ObjectMetadata;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::session::TransferSession;

/// Lazy, verified reader of one object revision.
///
/// Chunks are fetched in index order only when asked for. The digest is
/// recomputed as they arrive; after the last chunk the reader either ends
/// cleanly or reports [`StoreError::DigestMismatch`]. The revision stays
/// pinned by a read lease until the reader finishes, fails or is dropped.
pub struct ObjectReader {
    session: TransferSession,
    meta: ObjectMetadata,
    lease: Option<u64>,
    next_index: u32,
    hasher: Option<Box<dyn DigestHasher>>,
}

impl ObjectReader {
    pub(crate) fn new(session: TransferSession, meta: ObjectMetadata, lease: u64) -> Self {
        let hasher = new_hasher(meta.digest.algorithm());
        Self {
            session,
            meta,
            lease: Some(lease),
            next_index: 0,
            hasher: Some(hasher),
        }
    }

    /// Metadata of the revision being read.
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.meta
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// The next chunk payload, or `None` after the last one.
    pub async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        if self.next_index < self.meta.chunk_count {
            return match self.fetch(self.next_index).await {
                Ok(payload) => Ok(Some(payload)),
                Err(e) => {
                    self.release().await;
                    Err(e)
                }
            };
        }
        let Some(hasher) = self.hasher.take() else {
            return Ok(None);
        };
        self.release().await;
        let actual = hasher.finalize();
        if actual != self.meta.digest {
            warn!(
                bucket = %self.meta.bucket,
                name = %self.meta.name,
                expected = %self.meta.digest,
                %actual,
                "digest mismatch"
            );
            return Err(StoreError::DigestMismatch {
                expected: self.meta.digest.clone(),
                actual,
            });
        }
        Ok(None)
    }

    async fn fetch(&mut self, index: u32) -> StoreResult<Bytes> {
        let Some(lease) = self.lease else {
            return Err(StoreError::LeaseExpired("reader already released".into()));
        };
        let rev = self.meta.revision_id;
        let request = StoreMessage::GetChunk {
            bucket: self.meta.bucket.clone(),
            revision_id: rev,
            index,
            lease,
        };
        let reply = self
            .session
            .request(&Subject::chunk(&self.meta.bucket, rev), &request)
            .await?;
        let (header, payload) = match reply {
            StoreMessage::ChunkData { header, payload } => (header, payload),
            other => return Err(StoreError::unexpected(&other)),
        };
        if header.revision_id != rev || header.index != index {
            return Err(StoreError::InvalidArgument(format!(
                "asked for chunk {index} of {rev}, got {} of {}",
                header.index, header.revision_id
            )));
        }
        let expected = self.meta.chunk_len(index);
        if expected != Some(payload.len() as u64) {
            warn!(
                bucket = %self.meta.bucket,
                name = %self.meta.name,
                index,
                len = payload.len(),
                ?expected,
                "chunk length mismatch"
            );
            return Err(StoreError::InvalidArgument(format!(
                "chunk {index} of {rev} has {} bytes, expected {expected:?}",
                payload.len()
            )));
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&payload);
        }
        self.next_index += 1;
        self.session.record_chunk(payload.len());
        Ok(payload)
    }

    /// Stream every remaining byte into `writer`. Returns the bytes written.
    ///
    /// On a digest mismatch all bytes have been written before the error is
    /// returned.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> StoreResult<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(StoreError::StreamWrite)?;
            written += chunk.len() as u64;
        }
        writer.flush().await.map_err(StoreError::StreamWrite)?;
        Ok(written)
    }

    /// Stop reading and release the lease.
    pub async fn close(mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let msg = StoreMessage::ReleaseLease {
            bucket: self.meta.bucket.clone(),
            lease,
        };
        let subject = Subject::api(ApiOp::Release, Some(&self.meta.bucket));
        if let Err(e) = self.session.publish(&subject, &msg).await {
            // The lease expires on its own.
            debug!(lease, error = %e, "lease release failed");
        }
    }
}

impl Drop for ObjectReader {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let subject = Subject::api(ApiOp::Release, Some(&self.meta.bucket)).to_string();
        let msg = StoreMessage::ReleaseLease {
            bucket: self.meta.bucket.clone(),
            lease,
        };
        let Ok(payload) = StoreCodec::encode(&msg) else {
            return;
        };
        let transport = self.session.transport();
        handle.spawn(async move {
            if let Err(e) = transport.publish(&subject, payload).await {
                debug!(lease, error = %e, "lease release failed");
            }
        });
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("name", &self.meta.name)
            .field("revision", &self.meta.revision)
            .field("next_index", &self.next_index)
            .field("chunk_count", &self.meta.chunk_count)
            .finish()
    }
}
