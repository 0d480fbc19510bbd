use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ostore_protocol::{ApiOp, ChunkHeader, StoreMessage, Subject};
use ostore_transport::Transport;
use ostore_types::{BucketName, ObjectHeaders, ObjectMetadata, ObjectName, RevisionId};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::encoder::ChunkedEncoder;
use crate::error::{StoreError, StoreResult};
use crate::lister::ObjectLister;
use crate::reader::ObjectReader;
use crate::session::TransferSession;

type ObjectKey = (BucketName, ObjectName);

/// Object count and total size of a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketStatus {
    pub bucket: BucketName,
    pub objects: u64,
    pub total_size: u64,
}

/// Client of a chunked object store reached over a [`Transport`].
///
/// Puts to the same object serialize on a per-key async mutex; puts to
/// different objects and all reads proceed independently.
pub struct ObjectStore {
    transport: Arc<dyn Transport>,
    config: StoreConfig,
    key_locks: Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ObjectStore {
    pub fn new(transport: Arc<dyn Transport>, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// A fresh session with its own cancellation token.
    pub fn session(&self) -> TransferSession {
        self.session_with(CancellationToken::new())
    }

    /// A fresh session cancelled by `cancel`.
    pub fn session_with(&self, cancel: CancellationToken) -> TransferSession {
        TransferSession::new(Arc::clone(&self.transport), self.config.clone(), cancel)
    }

    fn key_lock(&self, bucket: &BucketName, name: &ObjectName) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("lock poisoned");
        // Entries only the map refers to are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry((bucket.clone(), name.clone())).or_default())
    }

    /// Store the contents of `reader` as the new current revision of
    /// `bucket/name`.
    pub async fn put<R>(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
        headers: ObjectHeaders,
        reader: R,
    ) -> StoreResult<ObjectMetadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.put_with(&self.session(), bucket, name, headers, reader).await
    }

    /// [`ObjectStore::put`] within a caller-owned session.
    ///
    /// If the put fails or the session is cancelled, the chunks written so
    /// far are abandoned and the previous revision stays current.
    pub async fn put_with<R>(
        &self,
        session: &TransferSession,
        bucket: &BucketName,
        name: &ObjectName,
        headers: ObjectHeaders,
        reader: R,
    ) -> StoreResult<ObjectMetadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        let lock = self.key_lock(bucket, name);
        let _guard = session.guard(async { Ok(lock.lock().await) }).await?;

        let revision_id = RevisionId::new();
        let mut encoder = ChunkedEncoder::new(reader, self.config.chunk_size, self.config.digest)?;
        debug!(%bucket, %name, revision = %revision_id, "put started");

        let uploaded = self.upload(session, &mut encoder, bucket, revision_id).await;
        let result = match uploaded {
            Ok(()) => match encoder.finish(bucket, name, headers, revision_id) {
                Ok(meta) => self.commit(session, meta).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(meta) => {
                info!(
                    %bucket,
                    %name,
                    revision = meta.revision,
                    size = meta.size,
                    chunks = meta.chunk_count,
                    "put committed"
                );
                Ok(meta)
            }
            Err(e) => {
                warn!(%bucket, %name, revision = %revision_id, error = %e, "put failed");
                self.abort(session, bucket, revision_id).await;
                Err(e)
            }
        }
    }

    async fn upload<R>(
        &self,
        session: &TransferSession,
        encoder: &mut ChunkedEncoder<R>,
        bucket: &BucketName,
        revision_id: RevisionId,
    ) -> StoreResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let subject = Subject::chunk(bucket, revision_id);
        while let Some(chunk) = session.guard(encoder.next_chunk()).await? {
            let len = chunk.payload.len();
            let request = StoreMessage::PutChunk {
                header: ChunkHeader::new(revision_id, chunk.index, chunk.is_final),
                payload: chunk.payload,
            };
            match session.request(&subject, &request).await? {
                StoreMessage::ChunkAck { index, .. } if index == chunk.index => {
                    session.record_chunk(len);
                }
                other => return Err(StoreError::unexpected(&other)),
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        session: &TransferSession,
        meta: ObjectMetadata,
    ) -> StoreResult<ObjectMetadata> {
        let subject = Subject::meta(&meta.bucket, &meta.name);
        let request = StoreMessage::CommitObject {
            meta,
            allow_overwrite: self.config.allow_overwrite,
        };
        match session.request(&subject, &request).await? {
            StoreMessage::Committed { meta } => Ok(meta),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    async fn abort(&self, session: &TransferSession, bucket: &BucketName, revision_id: RevisionId) {
        let msg = StoreMessage::AbortUpload {
            bucket: bucket.clone(),
            revision_id,
        };
        let subject = Subject::api(ApiOp::Abort, Some(bucket));
        if let Err(e) = session.publish(&subject, &msg).await {
            // The upload expires on the service side.
            debug!(revision = %revision_id, error = %e, "abort not delivered");
        }
    }

    /// Open the current revision for reading.
    pub async fn get(&self, bucket: &BucketName, name: &ObjectName) -> StoreResult<ObjectReader> {
        self.open(self.session(), bucket, name, None).await
    }

    /// Open a specific revision, current or retained.
    pub async fn get_revision(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
        revision: u64,
    ) -> StoreResult<ObjectReader> {
        self.open(self.session(), bucket, name, Some(revision)).await
    }

    /// [`ObjectStore::get`] within a caller-owned session.
    pub async fn get_with(
        &self,
        session: TransferSession,
        bucket: &BucketName,
        name: &ObjectName,
    ) -> StoreResult<ObjectReader> {
        self.open(session, bucket, name, None).await
    }

    async fn open(
        &self,
        session: TransferSession,
        bucket: &BucketName,
        name: &ObjectName,
        revision: Option<u64>,
    ) -> StoreResult<ObjectReader> {
        let request = StoreMessage::OpenObject {
            bucket: bucket.clone(),
            name: name.clone(),
            revision,
        };
        match session.request(&Subject::meta(bucket, name), &request).await? {
            StoreMessage::ObjectOpened { meta, lease } => {
                debug!(%bucket, %name, revision = meta.revision, lease, "object opened");
                Ok(ObjectReader::new(session, meta, lease))
            }
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// Current metadata of an object, without reading it.
    pub async fn info(&self, bucket: &BucketName, name: &ObjectName) -> StoreResult<ObjectMetadata> {
        let request = StoreMessage::GetInfo {
            bucket: bucket.clone(),
            name: name.clone(),
        };
        match self.session().request(&Subject::meta(bucket, name), &request).await? {
            StoreMessage::Info { meta } => Ok(meta),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// The current revision followed by retained ones, newest first.
    pub async fn revisions(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
    ) -> StoreResult<Vec<ObjectMetadata>> {
        let request = StoreMessage::ListRevisions {
            bucket: bucket.clone(),
            name: name.clone(),
        };
        match self.session().request(&Subject::meta(bucket, name), &request).await? {
            StoreMessage::Revisions { current, retained } => {
                let mut all = Vec::with_capacity(retained.len() + 1);
                all.push(current);
                all.extend(retained);
                Ok(all)
            }
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// List current revisions in commit order.
    pub fn list(&self, bucket: &BucketName) -> ObjectLister {
        self.list_from(bucket, None)
    }

    /// Resume a listing from a cursor returned by [`ObjectLister::cursor`].
    pub fn list_from(&self, bucket: &BucketName, cursor: Option<u64>) -> ObjectLister {
        ObjectLister::new(
            self.session(),
            bucket.clone(),
            cursor,
            self.config.list_page_size,
        )
    }

    /// Remove an object. Its chunks are reclaimed once no reader holds them.
    pub async fn delete(&self, bucket: &BucketName, name: &ObjectName) -> StoreResult<ObjectMetadata> {
        let lock = self.key_lock(bucket, name);
        let _guard = lock.lock().await;
        let request = StoreMessage::DeleteObject {
            bucket: bucket.clone(),
            name: name.clone(),
        };
        match self.session().request(&Subject::meta(bucket, name), &request).await? {
            StoreMessage::Deleted { meta } => {
                info!(%bucket, %name, revision = meta.revision, "object deleted");
                Ok(meta)
            }
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// Create a bucket. Returns `false` if it already existed.
    pub async fn create_bucket(&self, bucket: &BucketName) -> StoreResult<bool> {
        let request = StoreMessage::CreateBucket {
            bucket: bucket.clone(),
        };
        let subject = Subject::api(ApiOp::Create, Some(bucket));
        match self.session().request(&subject, &request).await? {
            StoreMessage::BucketCreated { created, .. } => Ok(created),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    pub async fn bucket_status(&self, bucket: &BucketName) -> StoreResult<BucketStatus> {
        let request = StoreMessage::BucketStatus {
            bucket: bucket.clone(),
        };
        let subject = Subject::api(ApiOp::Info, Some(bucket));
        match self.session().request(&subject, &request).await? {
            StoreMessage::BucketInfo {
                bucket,
                objects,
                total_size,
            } => Ok(BucketStatus {
                bucket,
                objects,
                total_size,
            }),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    pub async fn list_buckets(&self) -> StoreResult<Vec<BucketName>> {
        let subject = Subject::api(ApiOp::Buckets, None);
        match self.session().request(&subject, &StoreMessage::ListBuckets).await? {
            StoreMessage::Buckets { buckets } => Ok(buckets),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> StoreResult<()> {
        self.transport.close().await?;
        Ok(())
    }
}
